//! Serves and accepts files from a single directory over TFTP.
#![forbid(unsafe_code)]
#![warn(clippy::all)]

use clap::Parser;
use log::{error, info};
use tftp_server::Args;

#[tokio::main]
async fn main() {
    // read command line arguments
    let args = Args::parse();

    if let Err(err) = run(args).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

/// Runs the server until a graceful shutdown, rebinding on SIGHUP.
async fn run(args: Args) -> anyhow::Result<()> {
    loop {
        let (_addr, server) = tftp_server::start_server(args.clone())?;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hangup =
                signal(SignalKind::hangup()).map_err(|err| anyhow::anyhow!("SIGHUP handler: {err}"))?;
            tokio::select! {
                () = server => return Ok(()),
                _ = hangup.recv() => {
                    // dropping the server future closes the listener and
                    // every in-flight transfer before rebinding
                    info!("SIGHUP received, restarting");
                    continue;
                }
            }
        }

        #[cfg(not(unix))]
        {
            server.await;
            return Ok(());
        }
    }
}
