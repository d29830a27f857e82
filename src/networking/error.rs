//! Error types for discovery, transfers and the connection manager.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised by the discovery service.
///
/// None of these escape the discovery loops; they are logged where they occur.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No route to the outside world, so no preferred local address.
    #[error("could not resolve an outbound address: {0}")]
    AddressResolution(String),

    /// A single announcement could not be sent.
    #[error("failed to send announcement: {0}")]
    AnnounceSend(#[source] io::Error),

    /// Socket setup or receive failure.
    #[error("multicast transport error: {0}")]
    Transport(#[from] io::Error),
}

/// The header field a framing error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    FilenameLength,
    Filename,
    ContentLength,
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FilenameLength => write!(f, "filename length"),
            Self::Filename => write!(f, "filename"),
            Self::ContentLength => write!(f, "content length"),
        }
    }
}

/// A malformed or unreadable frame header.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("failed to read {field}: {source}")]
    Read {
        field: HeaderField,
        #[source]
        source: io::Error,
    },

    #[error("negative {field} in header: {value}")]
    NegativeLength { field: HeaderField, value: i64 },

    #[error("filename of {len} bytes exceeds limit of {max}")]
    FilenameTooLong { len: u64, max: u64 },

    #[error("content length {len} exceeds limit of {max}")]
    ContentTooLarge { len: u64, max: u64 },

    #[error("filename is not valid UTF-8")]
    InvalidFilename,
}

/// Which part of an outgoing frame was being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Header,
    Payload,
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header => write!(f, "header"),
            Self::Payload => write!(f, "payload"),
        }
    }
}

/// Errors from sending or receiving a single frame.
///
/// Every variant is terminal for the connection it occurred on.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The peer closed the connection cleanly between frames.
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("protocol framing error: {0}")]
    ProtocolFraming(#[from] FramingError),

    #[error("truncated transfer: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("failed to write {phase} to transport: {source}")]
    Send {
        phase: TransferPhase,
        #[source]
        source: io::Error,
    },

    #[error("failed to read source: {0}")]
    SourceRead(#[source] io::Error),

    #[error("source ended after {read} of {expected} bytes")]
    SourceExhausted { expected: u64, read: u64 },

    #[error("filename is longer than the protocol allows")]
    FilenameTooLong,

    #[error("failed to open destination for {filename}: {source}")]
    SinkOpen {
        filename: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write destination: {0}")]
    SinkWrite(#[source] io::Error),

    /// Dial, accept or raw socket failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl TransferError {
    /// True for a clean close at a frame boundary.
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::PeerClosed)
    }
}

/// Errors from the connection manager itself.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind transfer listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("transfer server is already serving")]
    AlreadyServing,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}
