//! Domain Errors
//!
//! Error types surfaced by the ports and the event codec.

use thiserror::Error;

/// Failure reported by a flash device.
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("flash access out of range: addr={addr} len={len}")]
    OutOfRange { addr: u32, len: usize },
    #[error("flash buffer must be exactly one sector ({expected} bytes), got {actual}")]
    BufferSize { expected: usize, actual: usize },
    #[error("buffer has no valid index header")]
    MissingIndex,
    #[error("misaligned flash write: addr={addr} len={len}")]
    Misaligned { addr: u32, len: usize },
    #[error("flash I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("flash device error: {0}")]
    Device(String),
}

/// Failure decoding the compact event stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("event code {0} has no zero bit in its low five bits")]
    InvalidCode(u32),
    #[error("truncated event at offset {0}")]
    Truncated(usize),
    #[error("varint overflow at offset {0}")]
    Overflow(usize),
}

/// Failure of one push exchange with the collector.
///
/// Every variant discards the exchange; none of them mutate local state.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("failed to resolve {0}")]
    Resolve(String),
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
    #[error("timed out during {0}")]
    Timeout(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected HTTP status {0}")]
    BadStatus(u16),
    #[error("malformed HTTP response")]
    MalformedResponse,
    #[error("response body too short: {0} bytes")]
    ShortResponse(usize),
    #[error("acknowledgment magic mismatch: expected {expected:#010x}, got {actual:#010x}")]
    BadMagic { expected: u32, actual: u32 },
}
