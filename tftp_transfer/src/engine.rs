use crate::{Error, FileBuffer, TransferEndpoint};
use log::{debug, warn};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tftp_proto::{ErrorCode, OptionKey, Packet, Request, TransferOptions, DEFAULT_BLOCK_SIZE};

/// Server-side knobs for a transfer. Everything the client doesn't
/// negotiate falls back to the RFC 1350 defaults: 512-byte blocks, a
/// window of one block, and this config's timeout.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Upper bound for `blksize` negotiation. Requests above it are
    /// clamped, never refused.
    pub max_block_size: u16,

    /// Read deadline per packet, unless the client negotiates `timeout`.
    pub timeout: Duration,

    /// How many retransmissions to attempt before giving up on a silent
    /// peer.
    pub max_retries: u32,

    /// An option to ignore during negotiation, as if the client never
    /// sent it.
    pub refuse: Option<OptionKey>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_block_size: tftp_proto::MAX_BLOCK_SIZE,
            timeout: Duration::from_secs(5),
            max_retries: 5,
            refuse: None,
        }
    }
}

/// The parameters a transfer actually runs with, plus the option list to
/// acknowledge back to the client.
struct Negotiated {
    reply: TransferOptions,
    block_size: usize,
    window_size: u16,
    timeout: Duration,
}

/// Accepts a subset of the request's options, clamping values where the
/// server has a tighter bound. Refusing an option means omitting it from
/// the reply; the decoder has already dropped anything out of range.
///
/// `file_size` answers a `tsize: 0` probe on read requests (RFC 2349);
/// everywhere else the requested value is echoed.
fn negotiate(request: &Request, config: &TransferConfig, file_size: Option<u64>) -> Negotiated {
    let mut reply = TransferOptions::new();
    let mut block_size = u64::from(DEFAULT_BLOCK_SIZE);
    let mut window_size: u64 = 1;
    let mut timeout = config.timeout;

    for (key, value) in request.options.iter() {
        if config.refuse == Some(key) {
            continue;
        }
        match key {
            OptionKey::Blksize => {
                let accepted = value.min(u64::from(config.max_block_size));
                block_size = accepted;
                reply.insert(key, accepted);
            }
            OptionKey::Timeout => {
                timeout = Duration::from_secs(value);
                reply.insert(key, value);
            }
            OptionKey::Tsize => {
                let answer = match file_size {
                    Some(size) if value == 0 => size,
                    _ => value,
                };
                reply.insert(key, answer);
            }
            OptionKey::Windowsize => {
                window_size = value;
                reply.insert(key, value);
            }
        }
    }

    Negotiated {
        reply,
        block_size: block_size as usize,
        window_size: window_size as u16,
        timeout,
    }
}

/// Runs a read request to completion: sends the backing file to the peer
/// block by block and retires each block as it is acknowledged.
///
/// With a negotiated `windowsize` above one, up to that many blocks are in
/// flight before an acknowledgement is expected; an acknowledgement mid-
/// window retires everything up to it and retransmits the rest. The
/// transfer ends when the final short block is acknowledged.
pub async fn send_file(
    endpoint: &mut TransferEndpoint,
    file: &mut FileBuffer,
    config: &TransferConfig,
) -> Result<(), Error> {
    let negotiated = negotiate(endpoint.request(), config, file.size());
    endpoint.set_read_deadline(Some(negotiated.timeout));

    let mut recv_buf = [0u8; 512];
    if !negotiated.reply.is_empty() {
        confirm_option_ack(endpoint, &negotiated.reply, config, &mut recv_buf).await?;
    }

    let block_size = negotiated.block_size;
    let window = usize::from(negotiated.window_size.max(1));
    let mut block_buf = vec![0u8; block_size];

    // unacknowledged block numbers, oldest first. The newest one's payload
    // lives in the file view's replay buffer; with a window above one, the
    // older payloads are copied into `backlog` just before the next read
    // overwrites the replay buffer.
    let mut in_flight: VecDeque<u16> = VecDeque::with_capacity(window);
    let mut backlog: VecDeque<Vec<u8>> = VecDeque::new();
    let mut next_block: u16 = 1;
    let mut eof = false;
    let mut retries = 0u32;

    loop {
        // keep the window full until the file runs out
        while in_flight.len() < window && !eof {
            if !in_flight.is_empty() {
                backlog.push_back(file.replay_bytes().to_vec());
            }
            let n = match file.read_next(&mut block_buf) {
                Ok(n) => n,
                Err(err) => {
                    let _ = endpoint.send_error(ErrorCode::NotDefined, "read failed").await;
                    return Err(err.into());
                }
            };
            if n < block_size {
                eof = true;
            }
            let packet = Packet::Data {
                block: next_block,
                data: block_buf[..n].to_vec(),
            };
            endpoint.send(&packet.to_bytes()).await?;
            in_flight.push_back(next_block);
            next_block = next_block.wrapping_add(1);
        }

        if in_flight.is_empty() {
            // the final short block has been acknowledged
            debug!("transfer to {} complete", endpoint.peer());
            return Ok(());
        }

        match recv_packet(endpoint, &mut recv_buf).await {
            Ok(Packet::Ack { block }) => {
                let Some(pos) = in_flight.iter().position(|b| *b == block) else {
                    // stale acknowledgement of an already-retired block
                    continue;
                };
                in_flight.drain(..=pos);
                backlog.drain(..backlog.len().min(pos + 1));
                retries = 0;
                if in_flight.is_empty() {
                    // nothing left unacknowledged, the replay block is spent
                    file.reset();
                } else {
                    // an acknowledgement mid-window means the blocks above
                    // it were lost
                    resend_window(endpoint, &in_flight, &backlog, file).await?;
                }
            }
            Ok(Packet::Error { code, message }) => return Err(Error::Peer { code, message }),
            Ok(other) => {
                debug!("ignoring {:?} mid-transfer", other.opcode());
            }
            Err(Error::UnknownTid(addr)) => reject_foreign(endpoint, addr).await,
            Err(Error::Timeout) => {
                retries += 1;
                if retries > config.max_retries {
                    return Err(Error::RetriesExhausted(config.max_retries));
                }
                debug!(
                    "peer {} silent, retransmitting {} block(s) (attempt {retries})",
                    endpoint.peer(),
                    in_flight.len(),
                );
                resend_window(endpoint, &in_flight, &backlog, file).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Runs a write request to completion: acknowledges the request, then
/// writes each in-order block and acknowledges every window (or the final
/// short block, whichever comes first).
///
/// Duplicates of already-acknowledged blocks repeat the last
/// acknowledgement; blocks ahead of the expected one are discarded and
/// recovered through the peer's own retransmission.
pub async fn receive_file(
    endpoint: &mut TransferEndpoint,
    file: &mut FileBuffer,
    config: &TransferConfig,
) -> Result<(), Error> {
    let negotiated = negotiate(endpoint.request(), config, None);
    endpoint.set_read_deadline(Some(negotiated.timeout));

    let block_size = negotiated.block_size;
    let window = negotiated.window_size.max(1);

    // the write request is confirmed by Ack 0, or by the option
    // acknowledgement when options were negotiated; the peer answers
    // either one with Data block 1
    let initial = if negotiated.reply.is_empty() {
        Packet::Ack { block: 0 }.to_bytes()
    } else {
        Packet::OptionAck(negotiated.reply.clone()).to_bytes()
    };
    endpoint.send(&initial).await?;

    let mut last_reply = initial;
    let mut expected: u16 = 1;
    let mut since_ack: u16 = 0;
    let mut retries = 0u32;
    let mut recv_buf = vec![0u8; block_size + 4];

    loop {
        match recv_packet(endpoint, &mut recv_buf).await {
            Ok(Packet::Data { block, data }) if block == expected => {
                if let Err(err) = file.write_next(&data) {
                    let _ = endpoint.send_error(ErrorCode::DiskFull, "write failed").await;
                    return Err(err.into());
                }
                let final_block = data.len() < block_size;
                expected = expected.wrapping_add(1);
                since_ack += 1;

                if final_block || since_ack >= window {
                    if final_block {
                        // land the data before acknowledging the last block
                        file.close()?;
                    }
                    let ack = Packet::Ack { block }.to_bytes();
                    endpoint.send(&ack).await?;
                    last_reply = ack;
                    since_ack = 0;
                    retries = 0;
                    if final_block {
                        debug!("transfer from {} complete", endpoint.peer());
                        return Ok(());
                    }
                }
            }
            Ok(Packet::Data { block, .. }) => {
                // a duplicate of something already acknowledged prompts the
                // last acknowledgement again; anything ahead of the window
                // is discarded
                let behind = expected.wrapping_sub(block);
                if behind != 0 && behind <= window {
                    endpoint.send(&last_reply).await?;
                }
            }
            Ok(Packet::Error { code, message }) => return Err(Error::Peer { code, message }),
            Ok(other) => {
                debug!("ignoring {:?} mid-transfer", other.opcode());
            }
            Err(Error::UnknownTid(addr)) => reject_foreign(endpoint, addr).await,
            Err(Error::Timeout) => {
                retries += 1;
                if retries > config.max_retries {
                    return Err(Error::RetriesExhausted(config.max_retries));
                }
                endpoint.send(&last_reply).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Sends the option acknowledgement for a read request and waits for the
/// confirming Ack 0, retransmitting the acknowledgement on timeout.
async fn confirm_option_ack(
    endpoint: &mut TransferEndpoint,
    reply: &TransferOptions,
    config: &TransferConfig,
    recv_buf: &mut [u8],
) -> Result<(), Error> {
    let oack = Packet::OptionAck(reply.clone()).to_bytes();
    endpoint.send(&oack).await?;

    let mut retries = 0u32;
    loop {
        match recv_packet(endpoint, recv_buf).await {
            Ok(Packet::Ack { block: 0 }) => return Ok(()),
            Ok(Packet::Error { code, message }) => return Err(Error::Peer { code, message }),
            Ok(other) => {
                debug!("ignoring {:?} while awaiting option confirmation", other.opcode());
            }
            Err(Error::UnknownTid(addr)) => reject_foreign(endpoint, addr).await,
            Err(Error::Timeout) => {
                retries += 1;
                if retries > config.max_retries {
                    return Err(Error::RetriesExhausted(config.max_retries));
                }
                endpoint.send(&oack).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn recv_packet(endpoint: &TransferEndpoint, buf: &mut [u8]) -> Result<Packet, Error> {
    let n = endpoint.recv(buf).await?;
    Ok(Packet::from_bytes(&buf[..n])?)
}

/// Answers a foreign-source datagram with an UnknownTid error. The
/// established transfer is left untouched.
async fn reject_foreign(endpoint: &TransferEndpoint, addr: SocketAddr) {
    warn!(
        "datagram from foreign TID {addr} during transfer with {}",
        endpoint.peer(),
    );
    if let Err(err) = endpoint
        .send_error_to(ErrorCode::UnknownTid, "unknown transfer ID", addr)
        .await
    {
        warn!("failed to reject foreign TID {addr}: {err}");
    }
}

/// Retransmits every unacknowledged block. All but the newest have their
/// payload in `backlog`; the newest comes straight out of the file view's
/// replay buffer, so lock-step transfers never keep a second copy.
async fn resend_window(
    endpoint: &TransferEndpoint,
    in_flight: &VecDeque<u16>,
    backlog: &VecDeque<Vec<u8>>,
    file: &FileBuffer,
) -> Result<(), Error> {
    for (i, block) in in_flight.iter().enumerate() {
        let payload = match backlog.get(i) {
            Some(payload) => payload.as_slice(),
            None => file.replay_bytes(),
        };
        let packet = Packet::Data {
            block: *block,
            data: payload.to_vec(),
        };
        endpoint.send(&packet.to_bytes()).await?;
    }
    Ok(())
}
