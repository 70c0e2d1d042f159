//! Domain Entities - Core business objects
//!
//! These entities represent the core concepts of the sensor log domain.
//! They have no external dependencies and contain only business logic.

use crate::domain::errors::{CodecError, PushError};
use serde::Serialize;

/// Event type carried in every event header.
///
/// A code must have at least one zero bit in its low five bits. The header
/// stores `code << 2 | tag`, so this guarantees the first header byte of any
/// event is never `0xff` and an erased byte always marks the end of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct EventCode(u16);

impl EventCode {
    /// Plantower PMS3003 particle counter frame.
    pub const PMS3003: EventCode = EventCode(1);
    /// Plantower PMS1003/5003/7003 particle counter frame.
    pub const PMS5003: EventCode = EventCode(2);
    /// Local and server clock correlation after a successful push.
    pub const POST_TIME: EventCode = EventCode(3);
    /// Node startup, carrying the boot reason and tick calibration.
    pub const STARTUP: EventCode = EventCode(4);
    pub const SHT2X_TEMP_HUM: EventCode = EventCode(5);
    pub const BMP180_TEMP_PRESSURE: EventCode = EventCode(6);
    pub const RTC_TIME_TEMP: EventCode = EventCode(7);
    /// The real-time clock was stepped to the server time.
    pub const TIME_STEP: EventCode = EventCode(8);
    pub const BMP280_TEMP_PRESSURE: EventCode = EventCode(9);
    pub const BME280_TEMP_PRESSURE_RH: EventCode = EventCode(10);
    pub const CLIENT_UTIME: EventCode = EventCode(11);
    /// First event of a segment after a stream interruption.
    pub const SEGMENT_START: EventCode = EventCode(12);
    pub const START_LOGGING: EventCode = EventCode(13);
    pub const PAUSE_LOGGING: EventCode = EventCode(14);
    pub const TEXT_MESSAGE: EventCode = EventCode(15);

    /// Validate a raw event code.
    pub fn new(code: u16) -> Result<Self, CodecError> {
        if code & 0x1f == 0x1f {
            return Err(CodecError::InvalidCode(code as u32));
        }
        Ok(Self(code))
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for EventCode {
    type Error = CodecError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Self::new(code)
    }
}

/// A decoded event with its reconstructed timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub code: u16,
    /// Counter ticks, reconstructed by summing the deltas of the buffer.
    pub timestamp: u32,
    pub payload: Vec<u8>,
    /// The time field was stored at 13-bit truncated resolution.
    pub low_res_time: bool,
}

/// Result of a flash history size query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferSize {
    /// Content size of the sector with trailing erased bytes stripped.
    pub size: u32,
    /// Index actually found; may be older than the one requested.
    pub index: u32,
    /// Next larger index present in the ring.
    pub next_index: Option<u32>,
    /// False only for the mutable head sector.
    pub sealed: bool,
}

impl BufferSize {
    /// Answer for an empty ring.
    pub fn empty() -> Self {
        Self {
            size: 0,
            index: 0,
            next_index: None,
            sealed: false,
        }
    }
}

/// Fixed-format acknowledgment returned by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushAck {
    pub magic: u32,
    pub server_sec: u32,
    pub server_usec: u32,
    pub index: u32,
    pub size: u32,
}

impl PushAck {
    pub const LEN: usize = 20;

    /// Parse the leading 20 bytes of a response body.
    ///
    /// Longer bodies are accepted for future extension.
    pub fn parse(body: &[u8]) -> Result<Self, PushError> {
        if body.len() < Self::LEN {
            return Err(PushError::ShortResponse(body.len()));
        }
        let word = |i: usize| u32::from_le_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);
        Ok(Self {
            magic: word(0),
            server_sec: word(4),
            server_usec: word(8),
            index: word(12),
            size: word(16),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.server_sec.to_le_bytes());
        out[8..12].copy_from_slice(&self.server_usec.to_le_bytes());
        out[12..16].copy_from_slice(&self.index.to_le_bytes());
        out[16..20].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

/// Expected acknowledgment magic for a request sent at `local_time`.
pub fn ack_magic(sensor_id: u32, local_time: u32) -> u32 {
    sensor_id ^ local_time
}
