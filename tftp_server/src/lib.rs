//! Serves and accepts files from a single directory over TFTP.
//!
//! Binds the well-known UDP port, accepts read and write requests, and
//! runs each transfer as its own task on a fresh ephemeral port. All
//! filenames are resolved inside one served directory; anything that
//! escapes it is refused.
#![forbid(unsafe_code)]
#![warn(clippy::all)]

mod connection_handler;
mod pool;

use anyhow::Context;
use clap::Parser;
use connection_handler::{handle_transfer, FilePolicy};
use log::{error, info, warn};
use pool::BufferPool;
use socket2::{Domain, Protocol, Type};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tftp_transfer::{Listener, OptionKey, TransferConfig};
use tokio::task::JoinSet;

/// How long a graceful shutdown waits for active transfers before
/// aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Address and port to listen on. Defaults to the wildcard address of
    /// the selected family on UDP port 69.
    #[arg(short, long)]
    pub address: Option<SocketAddr>,

    /// Force transfer ports (TIDs) into this range, given as "lo:hi".
    #[arg(short = 'R', long, value_parser = parse_port_range)]
    pub port_range: Option<(u16, u16)>,

    /// Serve and accept files only from this directory.
    #[arg(short, long, default_value = ".")]
    pub secure: PathBuf,

    /// Allow write requests to create new files. By default only
    /// existing files can be written.
    #[arg(short, long)]
    pub create: bool,

    /// Refuse write requests to files that already exist, instead of
    /// truncating them.
    #[arg(long)]
    pub no_clobber: bool,

    /// Ignore one TFTP option during negotiation
    /// (blksize, timeout, tsize or windowsize).
    #[arg(short, long, value_parser = parse_option_key)]
    pub refuse: Option<OptionKey>,

    /// Largest block size to accept during blksize negotiation.
    #[arg(short = 'B', long, default_value_t = tftp_proto::MAX_BLOCK_SIZE)]
    pub blocksize: u16,

    /// Seconds to wait for a packet before retransmitting.
    #[arg(short, long, default_value_t = 5)]
    pub timeout: u64,

    /// How many retransmissions to attempt before dropping a transfer.
    #[arg(short = 'T', long, default_value_t = 5)]
    pub retransmit: u32,

    /// Listen on IPv4 only.
    #[arg(short = '4', long, conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Listen on IPv6 only.
    #[arg(short = '6', long, conflicts_with = "ipv4")]
    pub ipv6: bool,

    /// Run standalone rather than under a supervisor that passes in the
    /// socket.
    #[arg(short, long)]
    pub listen: bool,

    /// Like --listen, staying attached to the terminal.
    #[arg(short = 'L', long)]
    pub foreground: bool,

    /// Log verbosity. (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub verbosity: log::LevelFilter,

    /// Shorthand for --verbosity debug.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Binds the listener and returns the bound address together with a
/// future that runs the server until a shutdown signal arrives.
///
/// Must be called from a tokio async context.
pub fn start_server(args: Args) -> anyhow::Result<(SocketAddr, impl Future<Output = ()>)> {
    let level = if args.verbose {
        args.verbosity.max(log::LevelFilter::Debug)
    } else {
        args.verbosity
    };
    if let Err(err) = env_logger::builder().filter_level(level).try_init() {
        error!("Non-fatal error. Couldn't initialize logger: {err}")
    }

    anyhow::ensure!(
        args.listen || args.foreground,
        "running under a socket-passing supervisor is not supported; pass --listen or --foreground"
    );

    let address = resolve_address(&args)?;
    let root = args
        .secure
        .canonicalize()
        .with_context(|| format!("Couldn't resolve served directory {:?}", args.secure))?;
    anyhow::ensure!(root.is_dir(), "served path {root:?} is not a directory");

    let socket = get_udp_listener(address)?;
    let mut listener = Listener::from_socket(socket);
    if let Some((lo, hi)) = args.port_range {
        listener.set_port_range(lo, hi);
    }
    let local_addr = listener
        .local_addr()
        .context("Couldn't determine local address")?;

    let config = TransferConfig {
        max_block_size: args.blocksize.clamp(tftp_proto::MIN_BLOCK_SIZE, tftp_proto::MAX_BLOCK_SIZE),
        timeout: Duration::from_secs(args.timeout.max(1)),
        max_retries: args.retransmit,
        refuse: args.refuse,
    };
    let policy = FilePolicy {
        root,
        create: args.create,
        no_clobber: args.no_clobber,
    };

    info!("Listening on {local_addr}");
    info!("Serving directory {:?}", policy.root);
    info!(
        "Writes: {}, creating new files: {}",
        if policy.no_clobber { "no-clobber" } else { "overwrite" },
        policy.create,
    );
    if let Some((lo, hi)) = args.port_range {
        info!("Transfer ports restricted to {lo}..={hi}");
    }
    if let Some(refused) = args.refuse {
        info!("Refusing the {refused} option");
    }

    Ok((local_addr, run_server(listener, config, policy)))
}

/// Accepts requests until a shutdown signal, then gives active transfers
/// [`SHUTDOWN_GRACE`] to finish before aborting them.
async fn run_server(listener: Listener, config: TransferConfig, policy: FilePolicy) {
    let pool = BufferPool::new();
    let mut transfers = JoinSet::new();
    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok(endpoint) => {
                        transfers.spawn(handle_transfer(
                            endpoint,
                            config.clone(),
                            policy.clone(),
                            pool.clone(),
                        ));
                    }
                    Err(err) => error!("Error accepting request: {err}"),
                }
            }
            // reap finished transfers so the set doesn't grow unbounded
            Some(_) = transfers.join_next(), if !transfers.is_empty() => {}
            _ = &mut shutdown => break,
        }
    }

    if transfers.is_empty() {
        info!("Shut down.");
        return;
    }

    info!(
        "Shutting down, waiting up to {SHUTDOWN_GRACE:?} for {} active transfer(s)",
        transfers.len(),
    );
    let drain = async {
        while transfers.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Grace period expired, aborting remaining transfers");
    }
    info!("Shut down.");
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(err) => {
                error!("Couldn't register SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn resolve_address(args: &Args) -> anyhow::Result<SocketAddr> {
    let address = match args.address {
        Some(address) => address,
        None if args.ipv6 => SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, tftp_proto::DEFAULT_PORT)),
        None => SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, tftp_proto::DEFAULT_PORT)),
    };
    anyhow::ensure!(
        !(args.ipv4 && address.is_ipv6()),
        "--ipv4 conflicts with the IPv6 address {address}"
    );
    anyhow::ensure!(
        !(args.ipv6 && address.is_ipv4()),
        "--ipv6 conflicts with the IPv4 address {address}"
    );
    Ok(address)
}

/// Returns a [`tokio::net::UdpSocket`] bound to `addr` with `SO_REUSEADDR`
/// set, so a restarted server can rebind the well-known port immediately.
fn get_udp_listener(addr: SocketAddr) -> anyhow::Result<tokio::net::UdpSocket> {
    let socket = socket2::Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("Couldn't create UDP socket")?;

    socket
        .set_reuse_address(true)
        .context("Couldn't set SO_REUSEADDR")?;

    if addr.is_ipv6() {
        socket
            .set_only_v6(true)
            .with_context(|| format!("Couldn't set IPV6_V6ONLY on {addr}"))?;
    }

    socket
        .bind(&addr.into())
        .with_context(|| format!("Couldn't bind socket to address {addr}"))?;

    socket
        .set_nonblocking(true)
        .context("Couldn't set UDP socket to non blocking")?;

    let socket: std::net::UdpSocket = socket.into();
    tokio::net::UdpSocket::from_std(socket).context("Couldn't create async UDP socket")
}

/// Parses "lo:hi" into an inclusive port range.
fn parse_port_range(s: &str) -> Result<(u16, u16), String> {
    let (lo, hi) = s
        .split_once(':')
        .ok_or_else(|| format!("expected \"lo:hi\", got {s:?}"))?;
    let lo: u16 = lo.parse().map_err(|_| format!("bad port {lo:?}"))?;
    let hi: u16 = hi.parse().map_err(|_| format!("bad port {hi:?}"))?;
    if lo == 0 || lo > hi {
        return Err(format!("{lo}:{hi} is not a valid port range"));
    }
    Ok((lo, hi))
}

fn parse_option_key(s: &str) -> Result<OptionKey, String> {
    OptionKey::from_wire(s).ok_or_else(|| format!("unknown TFTP option {s:?}"))
}
