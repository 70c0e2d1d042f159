//! Event Codec
//!
//! Compact variable-length encoding of one event: a LEB128 header word whose
//! two low bits are a tag, optionally followed by the event code and payload
//! size, then a delta-encoded time field and the raw payload.
//!
//! ```text
//!   bit 0: 1 = new code and size follow, 0 = repeat the previous ones
//!   bit 1: 1 = time delta stored >> 13,   0 = full resolution delta
//! ```
//!
//! Each buffer stands alone: the encoder and decoder start from a zeroed
//! state (code 0, size 0, time 0) after the 8 byte index header. Unused
//! bytes are erased (`0xff`) and no valid header starts with `0xff`, so the
//! first erased byte marks the end of the content.

use crate::domain::entities::{Event, EventCode};
use crate::domain::errors::CodecError;
use crate::domain::value_objects::INDEX_HEADER_LEN;
use bytes::BufMut;

/// Value of an erased flash byte.
pub const ERASED: u8 = 0xff;

/// Largest possible encoded header: tag+code (3), size (5), time (5).
pub const MAX_HEADER_LEN: usize = 15;

/// Low time bits dropped by a coarse time field.
pub const COARSE_TIME_BITS: u32 = 13;
const COARSE_TIME_MASK: u32 = (1 << COARSE_TIME_BITS) - 1;

const TAG_NEW_HEADER: u64 = 1;
const TAG_COARSE_TIME: u64 = 2;

/// Emit an unsigned LEB128 value.
pub fn put_leb128<B: BufMut>(buf: &mut B, mut v: u64) {
    loop {
        if v < 0x80 {
            buf.put_u8(v as u8);
            return;
        }
        buf.put_u8((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
}

/// Emit a signed LEB128 value.
pub fn put_leb128_signed<B: BufMut>(buf: &mut B, mut v: i64) {
    loop {
        if (-0x40..=0x3f).contains(&v) {
            buf.put_u8((v & 0x7f) as u8);
            return;
        }
        buf.put_u8(((v & 0x7f) as u8) | 0x80);
        v >>= 7;
    }
}

/// Read an unsigned LEB128 value starting at `*pos`.
pub fn read_leb128(bytes: &[u8], pos: &mut usize) -> Result<u64, CodecError> {
    let start = *pos;
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or(CodecError::Truncated(start))?;
        *pos += 1;
        if shift >= 64 {
            return Err(CodecError::Overflow(start));
        }
        result |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
}

/// Read a signed LEB128 value, sign-extending from bit 6 of the last byte.
pub fn read_leb128_signed(bytes: &[u8], pos: &mut usize) -> Result<i64, CodecError> {
    let start = *pos;
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or(CodecError::Truncated(start))?;
        *pos += 1;
        if shift >= 64 {
            return Err(CodecError::Overflow(start));
        }
        result |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                result |= !0u64 << shift;
            }
            return Ok(result as i64);
        }
    }
}

/// Previous committed event, the reference for repeat headers and deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecState {
    last_code: u16,
    last_size: u32,
    last_time: u32,
}

impl CodecState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn last_time(&self) -> u32 {
        self.last_time
    }

    pub fn commit(&mut self, code: u16, size: u32, time: u32) {
        self.last_code = code;
        self.last_size = size;
        self.last_time = time;
    }
}

/// Timestamp to record for an event read at `now`.
///
/// Low resolution events may have their low 13 bits cleared, but only when
/// that cannot step behind `last_time`: either its low bits are already
/// zero, or its high bits differ from `now`.
pub fn effective_time(last_time: u32, now: u32, low_res: bool) -> u32 {
    if low_res
        && (last_time & COARSE_TIME_MASK == 0
            || last_time & !COARSE_TIME_MASK != now & !COARSE_TIME_MASK)
    {
        now & !COARSE_TIME_MASK
    } else {
        now
    }
}

/// An encoded event header.
#[derive(Debug, Clone, Copy)]
pub struct EventHeader {
    bytes: [u8; MAX_HEADER_LEN],
    len: usize,
}

impl EventHeader {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Encode the header for an event of `size` payload bytes at `time`.
///
/// Does not commit anything to `state`; the caller commits once the event
/// is actually stored.
pub fn encode_header(state: &CodecState, code: EventCode, size: u32, time: u32) -> EventHeader {
    let delta = time.wrapping_sub(state.last_time);
    let coarse = delta & COARSE_TIME_MASK == 0;

    let mut bytes = [0u8; MAX_HEADER_LEN];
    let mut out = &mut bytes[..];

    if code.value() == state.last_code && size == state.last_size {
        let v = if coarse {
            ((delta >> COARSE_TIME_BITS) as u64) << 2 | TAG_COARSE_TIME
        } else {
            (delta as u64) << 2
        };
        put_leb128(&mut out, v);
    } else if coarse {
        put_leb128(&mut out, (code.value() as u64) << 2 | TAG_COARSE_TIME | TAG_NEW_HEADER);
        put_leb128(&mut out, size as u64);
        put_leb128(&mut out, (delta >> COARSE_TIME_BITS) as u64);
    } else {
        put_leb128(&mut out, (code.value() as u64) << 2 | TAG_NEW_HEADER);
        put_leb128(&mut out, size as u64);
        put_leb128(&mut out, delta as u64);
    }

    let len = MAX_HEADER_LEN - out.remaining_mut();
    EventHeader { bytes, len }
}

/// One event borrowed from an encoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedEvent<'a> {
    pub code: u16,
    pub timestamp: u32,
    pub payload: &'a [u8],
    /// Header reused the previous code and size.
    pub repeated: bool,
    /// Time field was stored at coarse resolution.
    pub coarse_time: bool,
    /// Byte offset of the header within the buffer.
    pub offset: usize,
}

impl DecodedEvent<'_> {
    pub fn to_event(&self) -> Event {
        Event {
            code: self.code,
            timestamp: self.timestamp,
            payload: self.payload.to_vec(),
            low_res_time: self.coarse_time,
        }
    }
}

/// Streaming decoder over a buffer or flash sector image.
pub struct EventDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    state: CodecState,
    failed: bool,
}

/// Decode the events of a buffer image that starts with its index header.
pub fn decode_events(buffer: &[u8]) -> EventDecoder<'_> {
    EventDecoder {
        bytes: buffer,
        pos: INDEX_HEADER_LEN.min(buffer.len()),
        state: CodecState::default(),
        failed: false,
    }
}

impl<'a> EventDecoder<'a> {
    /// Offset just past the last decoded event.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn decode_one(&mut self) -> Result<DecodedEvent<'a>, CodecError> {
        let offset = self.pos;
        let mut pos = self.pos;
        let head = read_leb128(self.bytes, &mut pos)?;
        let coarse = head & TAG_COARSE_TIME != 0;
        let repeated = head & TAG_NEW_HEADER == 0;

        let (code, size, raw_time) = if repeated {
            (self.state.last_code, self.state.last_size, head >> 2)
        } else {
            let code = u16::try_from(head >> 2).map_err(|_| CodecError::Overflow(offset))?;
            let size = read_leb128(self.bytes, &mut pos)?;
            let size = u32::try_from(size).map_err(|_| CodecError::Overflow(offset))?;
            let raw_time = read_leb128(self.bytes, &mut pos)?;
            (code, size, raw_time)
        };

        let delta = if coarse {
            (raw_time as u32) << COARSE_TIME_BITS
        } else {
            raw_time as u32
        };
        let timestamp = self.state.last_time.wrapping_add(delta);

        let end = pos
            .checked_add(size as usize)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(CodecError::Truncated(offset))?;
        let payload = &self.bytes[pos..end];

        self.state.commit(code, size, timestamp);
        self.pos = end;

        Ok(DecodedEvent {
            code,
            timestamp,
            payload,
            repeated,
            coarse_time: coarse,
            offset,
        })
    }
}

impl<'a> Iterator for EventDecoder<'a> {
    type Item = Result<DecodedEvent<'a>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.bytes.len() || self.bytes[self.pos] == ERASED {
            return None;
        }
        match self.decode_one() {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
