use crate::Error;
use log::{debug, warn};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tftp_proto::{peek_opcode, ErrorCode, Opcode, Packet, Request};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

/// Initial requests larger than this are malformed; a filename, a mode and
/// a handful of options fit comfortably.
pub const MAX_REQUEST_LEN: usize = 1024;

/// How many random picks to try before letting the OS choose a port.
const PORT_RANGE_ATTEMPTS: usize = 10;

/// Owns the well-known TFTP socket and hands out one [`TransferEndpoint`]
/// per accepted request.
///
/// The listener never takes part in transfers itself: per RFC 1350, the
/// reply to a request comes from a fresh ephemeral port which becomes the
/// server's transfer identifier (TID) for that transfer.
pub struct Listener {
    socket: UdpSocket,
    /// Serialises `accept` so concurrent callers can't interleave reads
    /// of the well-known socket.
    accept_lock: Mutex<()>,
    port_range: Option<(u16, u16)>,
}

impl Listener {
    /// Binds the well-known socket on `addr`.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        Ok(Self::from_socket(UdpSocket::bind(addr).await?))
    }

    /// Wraps an already-bound socket, for callers that configure socket
    /// options themselves before handing the socket over.
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket,
            accept_lock: Mutex::new(()),
            port_range: None,
        }
    }

    /// Restricts ephemeral transfer ports to `lo..=hi`. The range `(0, 0)`
    /// means no restriction.
    pub fn set_port_range(&mut self, lo: u16, hi: u16) {
        self.port_range = if lo == 0 && hi == 0 {
            None
        } else {
            Some((lo, hi))
        };
    }

    /// The address the well-known socket is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for the next valid read or write request and returns a
    /// [`TransferEndpoint`] for it, bound to a fresh ephemeral port.
    ///
    /// Datagrams that aren't requests are answered with an
    /// [`ErrorCode::IllegalOperation`] packet and never create a transfer.
    /// Requests that don't decode are answered with the nearest error code.
    /// Neither ends the accept loop.
    pub async fn accept(&self) -> Result<TransferEndpoint, Error> {
        let _guard = self.accept_lock.lock().await;

        let mut buf = [0u8; MAX_REQUEST_LEN];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await?;

            match peek_opcode(&buf[..n]) {
                Some(Opcode::Rrq) | Some(Opcode::Wrq) => {}
                _ => {
                    debug!("dropping non-request datagram from {peer}");
                    self.send_error_to(ErrorCode::IllegalOperation, "cannot perform operation", peer)
                        .await;
                    continue;
                }
            }

            let (opcode, request) = match Packet::from_bytes(&buf[..n]) {
                Ok(Packet::ReadRequest(request)) => (Opcode::Rrq, request),
                Ok(Packet::WriteRequest(request)) => (Opcode::Wrq, request),
                // peek said Rrq or Wrq, so from_bytes can only return those
                // variants or fail
                Ok(_) => continue,
                Err(err) => {
                    warn!("undecodable request from {peer}: {err}");
                    self.send_error_to(err.error_code(), "could not decode request", peer)
                        .await;
                    continue;
                }
            };

            let socket = match bind_ephemeral(self.port_range, peer).await {
                Ok(socket) => socket,
                Err(err) => {
                    self.send_error_to(ErrorCode::NotDefined, "could not open transfer port", peer)
                        .await;
                    return Err(err.into());
                }
            };

            debug!(
                "accepted {opcode:?} for {:?} from {peer}, transfer port {}",
                request.filename,
                socket.local_addr().map(|a| a.port()).unwrap_or_default(),
            );

            return Ok(TransferEndpoint::new(socket, peer, opcode, request));
        }
    }

    /// Best-effort error reply from the well-known socket. Error packets
    /// are a courtesy and never retried, so failures are only logged.
    async fn send_error_to(&self, code: ErrorCode, message: &str, addr: SocketAddr) {
        let packet = Packet::Error {
            code,
            message: message.to_string(),
        };
        if let Err(err) = self.socket.send_to(&packet.to_bytes(), addr).await {
            warn!("failed to send error packet to {addr}: {err}");
        }
    }
}

/// Binds a socket on an ephemeral port of `peer`'s address family.
///
/// With a configured port range, tries up to [`PORT_RANGE_ATTEMPTS`]
/// uniform random picks in `lo..=hi` before falling back to an OS-chosen
/// port. Without one, the OS chooses directly.
async fn bind_ephemeral(
    range: Option<(u16, u16)>,
    peer: SocketAddr,
) -> std::io::Result<UdpSocket> {
    let unspecified: IpAddr = if peer.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };

    if let Some((lo, hi)) = range {
        let candidates: Vec<u16> = {
            let mut rng = rand::thread_rng();
            (0..PORT_RANGE_ATTEMPTS)
                .map(|_| rng.gen_range(lo..=hi))
                .collect()
        };
        for port in candidates {
            match UdpSocket::bind((unspecified, port)).await {
                Ok(socket) => return Ok(socket),
                Err(err) => debug!("transfer port {port} unavailable: {err}"),
            }
        }
    }

    UdpSocket::bind((unspecified, 0)).await
}

/// One side of an active transfer: an ephemeral socket, the peer's fixed
/// address, and the request that started it all.
///
/// The socket is deliberately left unconnected. Packets from any other
/// source must be answered with an [`ErrorCode::UnknownTid`] error while
/// the transfer carries on undisturbed, so [`recv()`](Self::recv) surfaces
/// them as [`Error::UnknownTid`] instead of letting the kernel filter them
/// out.
pub struct TransferEndpoint {
    socket: UdpSocket,
    peer: SocketAddr,
    opcode: Opcode,
    request: Request,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl TransferEndpoint {
    /// Wraps an ephemeral `socket` talking to `peer` about `request`.
    pub fn new(socket: UdpSocket, peer: SocketAddr, opcode: Opcode, request: Request) -> Self {
        Self {
            socket,
            peer,
            opcode,
            request,
            read_timeout: None,
            write_timeout: None,
        }
    }

    /// The request that created this transfer.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// [`Opcode::Rrq`] or [`Opcode::Wrq`].
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// The peer's address. Its port is the peer's transfer identifier.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The local address. Its port is this side's transfer identifier.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Applies a relative deadline to every subsequent [`recv()`](Self::recv).
    pub fn set_read_deadline(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Applies a relative deadline to every subsequent send.
    pub fn set_write_deadline(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    /// Sends `bytes` to the peer.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), Error> {
        match self.write_timeout {
            Some(deadline) => {
                tokio::time::timeout(deadline, self.socket.send_to(bytes, self.peer))
                    .await
                    .map_err(|_| Error::Timeout)??;
            }
            None => {
                self.socket.send_to(bytes, self.peer).await?;
            }
        }
        Ok(())
    }

    /// Sends `bytes` to an arbitrary address, used for error replies to
    /// foreign sources.
    pub async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<(), Error> {
        self.socket.send_to(bytes, addr).await?;
        Ok(())
    }

    /// Receives one datagram from the peer.
    ///
    /// Returns [`Error::Timeout`] when the read deadline passes and
    /// [`Error::UnknownTid`] when the datagram came from any source other
    /// than the peer; neither ends the transfer by itself.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let (n, addr) = match self.read_timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.socket.recv_from(buf))
                .await
                .map_err(|_| Error::Timeout)??,
            None => self.socket.recv_from(buf).await?,
        };

        if addr != self.peer {
            return Err(Error::UnknownTid(addr));
        }
        Ok(n)
    }

    /// Encodes and sends an error packet to the peer. Error packets are
    /// never retried.
    pub async fn send_error(&self, code: ErrorCode, message: &str) -> Result<(), Error> {
        let packet = Packet::Error {
            code,
            message: message.to_string(),
        };
        self.send(&packet.to_bytes()).await
    }

    /// Encodes and sends an error packet to a foreign source.
    pub async fn send_error_to(
        &self,
        code: ErrorCode,
        message: &str,
        addr: SocketAddr,
    ) -> Result<(), Error> {
        let packet = Packet::Error {
            code,
            message: message.to_string(),
        };
        self.send_to(&packet.to_bytes(), addr).await
    }
}
