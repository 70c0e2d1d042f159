//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};

/// Continuity epoch for producer-side delta encoding.
///
/// The log advances the segment whenever the event stream is interrupted:
/// a buffer rotation, a pause/resume of logging, or a rejected append.
/// A producer holding a stale segment must drop any delta-encoding state
/// before retrying with the new one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Segment(u32);

impl Segment {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// The segment that follows this one.
    pub fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a single append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The event was encoded into the head buffer.
    Accepted,
    /// The event was consumed without being stored: logging is paused, or
    /// the event can never fit in an empty buffer. The caller must not retry.
    Discarded,
    /// The stream is discontinuous. Reset delta state and retry with the
    /// returned segment.
    Rejected(Segment),
}

impl AppendOutcome {
    /// Returns true unless the caller has to retry.
    pub fn is_settled(&self) -> bool {
        !matches!(self, AppendOutcome::Rejected(_))
    }

    /// The segment the caller should hold after this attempt.
    pub fn segment(&self, held: Segment) -> Segment {
        match self {
            AppendOutcome::Rejected(segment) => *segment,
            _ => held,
        }
    }
}

/// Redundant 8 byte index header at the start of every buffer and sector:
/// `index` little-endian followed by its bitwise complement.
pub const INDEX_HEADER_LEN: usize = 8;

/// Encode a buffer index into its redundant header form.
pub fn encode_index_header(index: u32) -> [u8; INDEX_HEADER_LEN] {
    let mut header = [0u8; INDEX_HEADER_LEN];
    header[0..4].copy_from_slice(&index.to_le_bytes());
    header[4..8].copy_from_slice(&(!index).to_le_bytes());
    header
}

/// Decode a redundant index header, rejecting mismatched copies.
pub fn decode_index_header(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < INDEX_HEADER_LEN {
        return None;
    }
    let index = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let inverse = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if index != !inverse {
        return None;
    }
    Some(index)
}
