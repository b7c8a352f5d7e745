//! Move files over UDP with the TFTP protocol.
//!
//! This library drives whole transfers, assuming [`tftp_proto`] for the
//! wire format. It has three layers:
//!
//! 1. A [`Listener`] owns the well-known socket (UDP port 69 by default),
//!    and [`Listener::accept()`] turns each valid read or write request
//!    into a [`TransferEndpoint`] bound to a fresh ephemeral port, the
//!    transfer identifier (TID) of RFC 1350 section 4.
//!
//! 2. A [`FileBuffer`] wraps the backing file with buffered I/O and a
//!    single-block replay buffer, so a lost block can be retransmitted
//!    without re-reading the file.
//!
//! 3. [`send_file()`] and [`receive_file()`] run the block transfer state
//!    machines end to end: option negotiation (RFC 2347/2348/2349/7440),
//!    lock-step or windowed data exchange, timeout-driven retransmission,
//!    and stop-on-short-block termination.
//!
//! # Example server loop
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use tftp_transfer::{send_file, FileBuffer, Listener, TransferConfig};
//!
//! let listener = Listener::bind("0.0.0.0:69".parse()?).await?;
//! loop {
//!     let mut endpoint = listener.accept().await?;
//!     let path = std::path::PathBuf::from(&endpoint.request().filename);
//!     let file = std::fs::File::open(&path)?;
//!     let mut buffer = FileBuffer::reading(file, path)?;
//!     send_file(&mut endpoint, &mut buffer, &TransferConfig::default()).await?;
//! }
//! # }
//! ```
#![forbid(unsafe_code)]
#![warn(clippy::all)]

mod conn;
mod engine;
mod file_buffer;

use std::net::SocketAddr;

pub use crate::conn::{Listener, TransferEndpoint, MAX_REQUEST_LEN};
pub use crate::engine::{receive_file, send_file, TransferConfig};
pub use crate::file_buffer::FileBuffer;

pub use tftp_proto::{
    ErrorCode, Mode, Opcode, OptionKey, Packet, Request, TransferOptions, DEFAULT_BLOCK_SIZE,
    DEFAULT_PORT, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};

/// `tftp_transfer` error.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// IO error on a socket or the backing file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A datagram from the established peer couldn't be decoded.
    #[error("packet decode error: {0}")]
    Packet(#[from] tftp_proto::DecodeError),

    /// A datagram arrived from a source other than the transfer's peer.
    ///
    /// The transfer is still alive: reply to the foreign source with
    /// [`ErrorCode::UnknownTid`] and keep waiting.
    #[error("packet from unexpected TID {0}")]
    UnknownTid(SocketAddr),

    /// No datagram arrived within the read deadline.
    #[error("timed out waiting for the peer")]
    Timeout,

    /// The peer aborted the transfer with an error packet.
    #[error("peer aborted the transfer: {code}: {message}")]
    Peer {
        /// The wire error code the peer sent.
        code: ErrorCode,
        /// The human-readable message the peer sent.
        message: String,
    },

    /// The peer stayed silent through every retransmission.
    #[error("no response from peer after {0} retransmissions")]
    RetriesExhausted(u32),
}
