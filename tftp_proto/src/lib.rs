//! Marshal and unmarshal TFTP packets.
//!
//! Implements the six packet shapes of
//! [RFC 1350](https://datatracker.ietf.org/doc/html/rfc1350) appendix I and
//! the option negotiation sub-protocol of RFC 2347, with the option values of
//! RFC 2348 (`blksize`), RFC 2349 (`timeout`, `tsize`) and RFC 7440
//! (`windowsize`).
//!
//! On its own, this crate doesn't do any I/O. In most cases you should use
//! one of the following crates:
//!
//! - **tftp_transfer**: A library that moves files over UDP with this codec.
//! - **tftp_server**: A server binary that serves a directory over TFTP.
//!
//! # Example
//!
//! ```
//! use tftp_proto::{Mode, Packet, Request, TransferOptions};
//!
//! let packet = Packet::ReadRequest(Request {
//!     filename: "firmware.bin".to_string(),
//!     mode: Mode::Octet,
//!     options: TransferOptions::new(),
//! });
//!
//! let bytes = packet.to_bytes();
//! assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
//! ```
#![forbid(unsafe_code)]
#![warn(clippy::all)]

mod tests;

use std::fmt::Display;

/// The well-known UDP port that TFTP servers listen on for initial requests.
pub const DEFAULT_PORT: u16 = 69;

/// Block size used when the client didn't negotiate `blksize` (RFC 1350).
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Smallest block size negotiable with the `blksize` option (RFC 2348).
pub const MIN_BLOCK_SIZE: u16 = 8;

/// Largest block size negotiable with the `blksize` option (RFC 2348).
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// The type of a TFTP packet, carried in its first two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Read request.
    Rrq = 1,
    /// Write request.
    Wrq = 2,
    /// Data block.
    Data = 3,
    /// Acknowledgement.
    Ack = 4,
    /// Error.
    Error = 5,
    /// Option acknowledgement (RFC 2347).
    Oack = 6,
}

impl Opcode {
    fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Rrq),
            2 => Some(Self::Wrq),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            6 => Some(Self::Oack),
            _ => None,
        }
    }
}

/// Reads the opcode of a raw datagram without decoding the rest of it.
///
/// Lets a listener cheaply reject non-request packets before
/// paying for a full [`Packet::from_bytes()`].
pub fn peek_opcode(bytes: &[u8]) -> Option<Opcode> {
    if bytes.len() < 2 {
        return None;
    }
    Opcode::from_u16(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// The transfer mode named in a read or write request.
///
/// Parsed case-insensitively off the wire. Anything else fails decoding
/// with an error that maps to [`ErrorCode::IllegalOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Line-ending-translated text transfer.
    Netascii,
    /// Raw 8-bit bytes.
    Octet,
    /// Obsolete mail transfer, accepted on the wire for compatibility.
    Mail,
}

impl Mode {
    fn from_wire(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Some(Self::Netascii),
            "octet" => Some(Self::Octet),
            "mail" => Some(Self::Mail),
            _ => None,
        }
    }

    /// The canonical lowercase wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Netascii => "netascii",
            Self::Octet => "octet",
            Self::Mail => "mail",
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A negotiable option carried on requests and option acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKey {
    /// `blksize`: bytes per data block, 8..=65464 (RFC 2348).
    Blksize,
    /// `timeout`: retransmission timeout in seconds, 1..=255 (RFC 2349).
    Timeout,
    /// `tsize`: transfer size in bytes, any non-negative value (RFC 2349).
    Tsize,
    /// `windowsize`: blocks per acknowledgement, 1..=65535 (RFC 7440).
    Windowsize,
}

impl OptionKey {
    /// Parses a wire option name, case-insensitively.
    /// Returns `None` for names this implementation doesn't know.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "blksize" => Some(Self::Blksize),
            "timeout" => Some(Self::Timeout),
            "tsize" => Some(Self::Tsize),
            "windowsize" => Some(Self::Windowsize),
            _ => None,
        }
    }

    /// The canonical lowercase wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blksize => "blksize",
            Self::Timeout => "timeout",
            Self::Tsize => "tsize",
            Self::Windowsize => "windowsize",
        }
    }

    /// Whether `value` is within the range the RFCs permit for this option.
    pub fn in_range(&self, value: u64) -> bool {
        match self {
            Self::Blksize => {
                (u64::from(MIN_BLOCK_SIZE)..=u64::from(MAX_BLOCK_SIZE)).contains(&value)
            }
            Self::Timeout => (1..=255).contains(&value),
            Self::Tsize => true,
            Self::Windowsize => (1..=65535).contains(&value),
        }
    }
}

impl Display for OptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The options attached to a request or option acknowledgement.
///
/// Keys are unique. Insertion order is preserved and is the order options
/// are written to the wire, so an OACK built from a request lists the
/// accepted options in the order the client sent them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOptions(Vec<(OptionKey, u64)>);

impl TransferOptions {
    /// An empty option list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, replacing an existing entry in place.
    pub fn insert(&mut self, key: OptionKey, value: u64) {
        if let Some(entry) = self.0.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.0.push((key, value));
        }
    }

    /// The value negotiated for `key`, if present.
    pub fn get(&self, key: OptionKey) -> Option<u64> {
        self.0.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&mut self, key: OptionKey) -> Option<u64> {
        let pos = self.0.iter().position(|(k, _)| *k == key)?;
        Some(self.0.remove(pos).1)
    }

    /// Iterates over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (OptionKey, u64)> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(OptionKey, u64)> for TransferOptions {
    fn from_iter<T: IntoIterator<Item = (OptionKey, u64)>>(iter: T) -> Self {
        let mut options = Self::new();
        for (key, value) in iter {
            options.insert(key, value);
        }
        options
    }
}

/// A TFTP error code as specified in RFC 1350 appendix I and RFC 2347.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Not defined, see error message.
    NotDefined = 0,
    /// File not found.
    FileNotFound = 1,
    /// Access violation.
    AccessViolation = 2,
    /// Disk full or allocation exceeded.
    DiskFull = 3,
    /// Illegal TFTP operation.
    IllegalOperation = 4,
    /// Unknown transfer ID.
    UnknownTid = 5,
    /// File already exists.
    FileAlreadyExists = 6,
    /// No such user.
    NoSuchUser = 7,
    /// Option negotiation ended by the peer (RFC 2347).
    RequestDenied = 8,
}

impl ErrorCode {
    /// Decodes a wire error code. Codes this implementation doesn't know
    /// fall back to [`ErrorCode::NotDefined`].
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            1 => Self::FileNotFound,
            2 => Self::AccessViolation,
            3 => Self::DiskFull,
            4 => Self::IllegalOperation,
            5 => Self::UnknownTid,
            6 => Self::FileAlreadyExists,
            7 => Self::NoSuchUser,
            8 => Self::RequestDenied,
            _ => Self::NotDefined,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotDefined => write!(f, "not defined"),
            Self::FileNotFound => write!(f, "file not found"),
            Self::AccessViolation => write!(f, "access violation"),
            Self::DiskFull => write!(f, "disk full or allocation exceeded"),
            Self::IllegalOperation => write!(f, "illegal TFTP operation"),
            Self::UnknownTid => write!(f, "unknown transfer ID"),
            Self::FileAlreadyExists => write!(f, "file already exists"),
            Self::NoSuchUser => write!(f, "no such user"),
            Self::RequestDenied => write!(f, "request denied"),
        }
    }
}

/// Packet decoding error.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum DecodeError {
    /// The datagram is shorter than the fixed header of its packet type.
    #[error("truncated packet of {0} bytes")]
    TruncatedPacket(usize),

    /// The first two bytes name an opcode outside 1..=6.
    #[error("opcode {0} not recognized")]
    UnrecognizedOpcode(u16),

    /// A request didn't carry both a filename and a mode.
    #[error("request is missing a filename or mode")]
    IncompleteRequest,

    /// A filename, mode or error message contains invalid UTF-8.
    #[error("string field contains invalid UTF-8")]
    InvalidString(#[from] std::str::Utf8Error),

    /// The transfer mode is none of netascii, octet or mail.
    #[error("transfer mode {0:?} not recognized")]
    UnknownMode(String),
}

impl DecodeError {
    /// The wire error code that describes this failure to the peer,
    /// for replies on the initial request path.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::TruncatedPacket(_) => ErrorCode::NotDefined,
            Self::UnrecognizedOpcode(_)
            | Self::IncompleteRequest
            | Self::InvalidString(_)
            | Self::UnknownMode(_) => ErrorCode::IllegalOperation,
        }
    }
}

/// The body shared by read and write requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Requested file, relative to whatever root the server enforces.
    pub filename: String,
    /// Transfer mode.
    pub mode: Mode,
    /// Options the peer wants to negotiate. Empty when the peer speaks
    /// plain RFC 1350.
    pub options: TransferOptions,
}

/// A TFTP protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Asks the server to send `filename` (opcode 1).
    ReadRequest(Request),
    /// Asks the server to receive `filename` (opcode 2).
    WriteRequest(Request),
    /// One block of file content (opcode 3). A payload shorter than the
    /// negotiated block size marks the end of the transfer.
    Data { block: u16, data: Vec<u8> },
    /// Acknowledges a data block, or block 0 to confirm a write request
    /// or an option acknowledgement (opcode 4).
    Ack { block: u16 },
    /// Aborts a transfer (opcode 5). Never retried, never acknowledged.
    Error { code: ErrorCode, message: String },
    /// Lists the options a server accepted (opcode 6).
    OptionAck(TransferOptions),
}

impl Packet {
    /// The opcode this packet carries on the wire.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::ReadRequest(_) => Opcode::Rrq,
            Self::WriteRequest(_) => Opcode::Wrq,
            Self::Data { .. } => Opcode::Data,
            Self::Ack { .. } => Opcode::Ack,
            Self::Error { .. } => Opcode::Error,
            Self::OptionAck(_) => Opcode::Oack,
        }
    }

    /// Decodes one datagram.
    ///
    /// Unknown option names and out-of-range option values are dropped
    /// silently rather than failing the whole request, so clients sending
    /// extensions from future RFCs still get served.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < 2 {
            return Err(DecodeError::TruncatedPacket(bytes.len()));
        }
        let raw_op = u16::from_be_bytes([bytes[0], bytes[1]]);
        let opcode = Opcode::from_u16(raw_op).ok_or(DecodeError::UnrecognizedOpcode(raw_op))?;

        match opcode {
            Opcode::Rrq => Ok(Self::ReadRequest(decode_request(&bytes[2..])?)),
            Opcode::Wrq => Ok(Self::WriteRequest(decode_request(&bytes[2..])?)),
            Opcode::Data => {
                if bytes.len() < 4 {
                    return Err(DecodeError::TruncatedPacket(bytes.len()));
                }
                Ok(Self::Data {
                    block: u16::from_be_bytes([bytes[2], bytes[3]]),
                    data: bytes[4..].to_vec(),
                })
            }
            Opcode::Ack => {
                if bytes.len() < 4 {
                    return Err(DecodeError::TruncatedPacket(bytes.len()));
                }
                Ok(Self::Ack {
                    block: u16::from_be_bytes([bytes[2], bytes[3]]),
                })
            }
            Opcode::Error => {
                if bytes.len() < 4 {
                    return Err(DecodeError::TruncatedPacket(bytes.len()));
                }
                Ok(Self::Error {
                    code: ErrorCode::from_u16(u16::from_be_bytes([bytes[2], bytes[3]])),
                    message: decode_error_message(&bytes[4..])?,
                })
            }
            Opcode::Oack => Ok(Self::OptionAck(decode_options(&null_terminated(
                &bytes[2..],
            )))),
        }
    }

    /// Encodes this packet for the wire. Never fails for in-range values.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&(self.opcode() as u16).to_be_bytes());

        match self {
            Self::ReadRequest(req) | Self::WriteRequest(req) => {
                extend_null_terminated(&mut out, &req.filename);
                extend_null_terminated(&mut out, req.mode.as_str());
                encode_options(&mut out, &req.options);
            }
            Self::Data { block, data } => {
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(data);
            }
            Self::Ack { block } => {
                out.extend_from_slice(&block.to_be_bytes());
            }
            Self::Error { code, message } => {
                out.extend_from_slice(&(*code as u16).to_be_bytes());
                extend_null_terminated(&mut out, message);
            }
            Self::OptionAck(options) => {
                encode_options(&mut out, options);
            }
        }
        out
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::ReadRequest(req) | Self::WriteRequest(req) => {
                2 + req.filename.len() + 1 + req.mode.as_str().len() + 1
            }
            Self::Data { data, .. } => 4 + data.len(),
            Self::Ack { .. } => 4,
            Self::Error { message, .. } => 4 + message.len() + 1,
            Self::OptionAck(_) => 2,
        }
    }
}

/// Collects the null-terminated byte strings in `bytes`, in order.
/// A non-empty tail without a terminator is kept too; empty strings are
/// skipped.
fn null_terminated(mut bytes: &[u8]) -> Vec<&[u8]> {
    let mut strings = Vec::new();
    while let Some(pos) = bytes.iter().position(|&b| b == 0) {
        if pos > 0 {
            strings.push(&bytes[..pos]);
        }
        bytes = &bytes[pos + 1..];
    }
    if !bytes.is_empty() {
        strings.push(bytes);
    }
    strings
}

fn decode_request(body: &[u8]) -> Result<Request, DecodeError> {
    let strings = null_terminated(body);
    if strings.len() < 2 {
        return Err(DecodeError::IncompleteRequest);
    }

    let filename = std::str::from_utf8(strings[0])?.to_string();
    let mode_str = std::str::from_utf8(strings[1])?;
    let mode =
        Mode::from_wire(mode_str).ok_or_else(|| DecodeError::UnknownMode(mode_str.to_string()))?;

    Ok(Request {
        filename,
        mode,
        options: decode_options(&strings[2..]),
    })
}

/// Parses `name value` string pairs into options. Pairs with unknown names,
/// non-numeric values or out-of-range values are dropped, per RFC 2347's
/// rule that a server ignores options it doesn't accept.
fn decode_options(strings: &[&[u8]]) -> TransferOptions {
    let mut options = TransferOptions::new();
    for pair in strings.chunks_exact(2) {
        let Ok(name) = std::str::from_utf8(pair[0]) else {
            continue;
        };
        let Some(key) = OptionKey::from_wire(name) else {
            continue;
        };
        let Ok(value_str) = std::str::from_utf8(pair[1]) else {
            continue;
        };
        let Ok(value) = value_str.parse::<u64>() else {
            continue;
        };
        if key.in_range(value) {
            options.insert(key, value);
        }
    }
    options
}

/// Joins however many null-terminated strings an error packet carries into
/// one space-separated message.
fn decode_error_message(body: &[u8]) -> Result<String, DecodeError> {
    let mut message = String::new();
    for s in null_terminated(body) {
        let s = std::str::from_utf8(s)?;
        if !message.is_empty() {
            message.push(' ');
        }
        message.push_str(s);
    }
    Ok(message)
}

fn extend_null_terminated(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn encode_options(out: &mut Vec<u8>, options: &TransferOptions) {
    for (key, value) in options.iter() {
        extend_null_terminated(out, key.as_str());
        extend_null_terminated(out, &value.to_string());
    }
}
