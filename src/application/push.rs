//! Push Service - replication of flash history to the collector
//!
//! One call to [`PushService::push_once`] is one exchange: pick the next
//! chunk with the push cursor, frame and sign it, send it on a fresh
//! connection, then apply the collector's acknowledgment. Retry timing and
//! wake-ups belong to the push worker.
//!
//! Request body, all little-endian:
//!
//! ```text
//! sensor_id:u32 | local_time:u32 | index:u32 | offset:u32 | chunk | mac:28
//! ```
//!
//! where `mac = SHA3-224(key || sensor_id .. chunk)`.

use crate::application::event_log::EventLog;
use crate::domain::entities::{ack_magic, BufferSize, EventCode, PushAck};
use crate::domain::errors::PushError;
use crate::domain::ports::{PushTransport, TickSource, WallClock};
use bytes::{BufMut, Bytes, BytesMut};
use sha3::{Digest, Sha3_224};
use std::sync::Arc;

/// Length of the request MAC.
pub const MAC_LEN: usize = 28;

/// Fixed request fields before the chunk.
pub const REQUEST_HEADER_LEN: usize = 16;

/// Upper bound on cursor steps for one chunk search.
const MAX_CURSOR_STEPS: usize = 256;

/// Read access to the persisted history, as served by the flash store.
pub trait SectorHistory: Send + Sync {
    fn sector_size(&self) -> usize;

    fn buffer_size(&self, requested: u32) -> BufferSize;

    fn buffer_range(&self, index: u32, start: usize, end: usize) -> Option<Bytes>;

    fn maybe_more(&self) -> bool;

    fn clear_maybe_more(&self);
}

/// Identity, key, and policy of the push protocol.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub sensor_id: u32,
    /// Pre-shared MAC key.
    pub key: Vec<u8>,
    /// Largest chunk sent per request. Two SHA3-224 blocks by default.
    pub chunk_size: usize,
    /// Minimum server seconds between two POST_TIME events.
    pub post_time_interval_secs: u32,
    /// How far the local clock may run ahead before it is stepped back.
    pub clock_ahead_tolerance_secs: u32,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            sensor_id: 0,
            key: Vec::new(),
            chunk_size: 288,
            post_time_interval_secs: 60,
            clock_ahead_tolerance_secs: 4,
        }
    }
}

/// A slice of one flash index selected for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub offset: u32,
    pub data: Bytes,
}

/// How far the collector has acknowledged the history.
///
/// Process-local; after a restart the collector's acknowledgments move it to
/// wherever the collector wants to resume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushCursor {
    pub index: u32,
    pub size_being_pushed: u32,
    pub size_pushed: u32,
    pub sealed: bool,
    pub next_index: Option<u32>,
}

impl PushCursor {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    /// Restart the search at the newest index.
    fn reset_search(&mut self) {
        *self = Self::new(u32::MAX);
    }

    fn forget_sizes(&mut self) {
        self.size_being_pushed = 0;
        self.size_pushed = 0;
        self.sealed = false;
        self.next_index = None;
    }

    fn read_chunk(&self, history: &dyn SectorHistory, max: usize) -> Option<Chunk> {
        let len = (self.size_being_pushed - self.size_pushed).min(max as u32);
        let start = self.size_pushed as usize;
        history
            .buffer_range(self.index, start, start + len as usize)
            .map(|data| Chunk {
                index: self.index,
                offset: self.size_pushed,
                data,
            })
    }

    /// Find the next chunk to send, or `None` when everything available has
    /// been acknowledged.
    pub fn next_chunk(&mut self, history: &dyn SectorHistory, max_chunk: usize) -> Option<Chunk> {
        let sector_size = history.sector_size() as u32;

        for _ in 0..MAX_CURSOR_STEPS {
            let pending = self.size_being_pushed.wrapping_sub(self.size_pushed);
            if pending > sector_size {
                self.reset_search();
                return None;
            }
            if pending > 0 {
                let chunk = self.read_chunk(history, max_chunk);
                if chunk.is_none() {
                    // The index wrapped out of the ring.
                    self.reset_search();
                }
                return chunk;
            }

            // Re-query: the head index may have grown.
            let requested = self.index;
            let found = history.buffer_size(requested);
            self.index = found.index;
            self.size_being_pushed = found.size;
            self.sealed = found.sealed;
            self.next_index = found.next_index;
            if found.index != requested {
                self.size_pushed = 0;
            }

            if self.size_being_pushed > self.size_pushed {
                if let Some(chunk) = self.read_chunk(history, max_chunk) {
                    return Some(chunk);
                }
                self.forget_sizes();
                continue;
            }

            if self.size_being_pushed == self.size_pushed {
                match self.next_index {
                    Some(next) if self.sealed => {
                        self.index = next;
                        self.forget_sizes();
                        continue;
                    }
                    _ => return None,
                }
            }

            self.reset_search();
            return None;
        }

        tracing::warn!("push cursor made no progress at index {}", self.index);
        None
    }

    /// Apply the collector's acknowledgment of a chunk ending at `sent_end`.
    pub fn apply_ack(&mut self, ack: &PushAck, sent_end: u32) {
        if ack.index == self.index {
            self.size_pushed = ack.size.min(sent_end).min(self.size_being_pushed);
        } else if ack.index > self.index && self.next_index.is_none() {
            // Beyond anything stored here; chasing it would resend forever.
            tracing::warn!(
                "collector acknowledged unknown index {} (cursor at {})",
                ack.index,
                self.index
            );
            self.size_pushed = self.size_being_pushed;
        } else {
            // The collector wants to resume elsewhere; it will move us along.
            tracing::info!("collector moved push cursor to index {}", ack.index);
            self.index = ack.index;
            self.forget_sizes();
        }
    }
}

/// Frame and sign one push request body.
pub fn frame_request(sensor_id: u32, local_time: u32, chunk: &Chunk, key: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(REQUEST_HEADER_LEN + chunk.data.len() + MAC_LEN);
    body.put_u32_le(sensor_id);
    body.put_u32_le(local_time);
    body.put_u32_le(chunk.index);
    body.put_u32_le(chunk.offset);
    body.put_slice(&chunk.data);

    let mut hasher = Sha3_224::new();
    hasher.update(key);
    hasher.update(&body);
    let mac = hasher.finalize();
    body.put_slice(&mac);
    body.freeze()
}

/// Step `clock` to the server time when it is behind, or ahead by more than
/// `tolerance` seconds. Returns `(old, new)` when the clock was stepped.
pub fn correct_clock(clock: &dyn WallClock, server_sec: u32, tolerance: u32) -> Option<(i64, i64)> {
    let now = clock.now_secs()?;
    let server = server_sec as i64;
    if (now < server || now > server + tolerance as i64) && clock.step_to(server) {
        return Some((now, server));
    }
    None
}

/// Result of one push attempt.
#[derive(Debug)]
pub enum PushAttempt {
    /// The cursor found nothing new; `maybe_more` has been cleared.
    NothingToSend,
    /// A chunk was acknowledged.
    Sent { index: u32, offset: u32, len: usize },
    /// The exchange was discarded.
    Failed(PushError),
}

/// Network Replication Worker logic.
pub struct PushService {
    config: PushConfig,
    history: Arc<dyn SectorHistory>,
    transport: Arc<dyn PushTransport>,
    log: Arc<EventLog>,
    ticks: Arc<dyn TickSource>,
    clock: Arc<dyn WallClock>,
    cursor: PushCursor,
    last_post_time_sec: Option<u32>,
}

impl PushService {
    pub fn new(
        config: PushConfig,
        history: Arc<dyn SectorHistory>,
        transport: Arc<dyn PushTransport>,
        log: Arc<EventLog>,
        ticks: Arc<dyn TickSource>,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        Self {
            config,
            history,
            transport,
            log,
            ticks,
            clock,
            cursor: PushCursor::default(),
            last_post_time_sec: None,
        }
    }

    pub fn cursor(&self) -> PushCursor {
        self.cursor
    }

    pub fn maybe_more(&self) -> bool {
        self.history.maybe_more()
    }

    /// Run one exchange with the collector.
    ///
    /// The connection is opened before the chunk is chosen, so the chunk and
    /// its timestamp are as fresh as possible when sent.
    pub async fn push_once(&mut self) -> PushAttempt {
        self.transport.wait_link_up().await;
        let session = match self.transport.connect().await {
            Ok(session) => session,
            Err(e) => return PushAttempt::Failed(e),
        };

        // The cursor walk reads flash; run it on the blocking pool.
        let history = self.history.clone();
        let mut cursor = self.cursor;
        let max_chunk = self.config.chunk_size;
        let read = tokio::task::spawn_blocking(move || {
            let chunk = cursor.next_chunk(history.as_ref(), max_chunk);
            if chunk.is_none() {
                history.clear_maybe_more();
            }
            (cursor, chunk)
        });
        let chunk = match read.await {
            Ok((cursor, chunk)) => {
                self.cursor = cursor;
                chunk
            }
            Err(e) => {
                tracing::error!("history read task failed: {}", e);
                let e = std::io::Error::new(std::io::ErrorKind::Other, e);
                return PushAttempt::Failed(PushError::Io(e));
            }
        };
        let Some(chunk) = chunk else {
            return PushAttempt::NothingToSend;
        };

        let local_time = self.ticks.now();
        let request = frame_request(self.config.sensor_id, local_time, &chunk, &self.config.key);
        tracing::debug!(
            "pushing index {} offset {} ({} bytes)",
            chunk.index,
            chunk.offset,
            chunk.data.len()
        );

        let body = match session.exchange(request).await {
            Ok(body) => body,
            Err(e) => return PushAttempt::Failed(e),
        };
        let ack = match PushAck::parse(&body) {
            Ok(ack) => ack,
            Err(e) => return PushAttempt::Failed(e),
        };
        let expected = ack_magic(self.config.sensor_id, local_time);
        if ack.magic != expected {
            return PushAttempt::Failed(PushError::BadMagic {
                expected,
                actual: ack.magic,
            });
        }

        self.note_server_time(&ack, local_time);
        let sent_end = chunk.offset + chunk.data.len() as u32;
        self.cursor.apply_ack(&ack, sent_end);

        PushAttempt::Sent {
            index: chunk.index,
            offset: chunk.offset,
            len: chunk.data.len(),
        }
    }

    /// Correct the clock from an accepted acknowledgment and log the
    /// correlation between local ticks and server time.
    fn note_server_time(&mut self, ack: &PushAck, local_time: u32) {
        if let Some((old, new)) = correct_clock(
            self.clock.as_ref(),
            ack.server_sec,
            self.config.clock_ahead_tolerance_secs,
        ) {
            tracing::info!("clock stepped from {} to {}", old, new);
            let mut payload = [0u8; 8];
            payload[0..4].copy_from_slice(&(old as u32).to_le_bytes());
            payload[4..8].copy_from_slice(&(new as u32).to_le_bytes());
            self.log.append_with_retry(EventCode::TIME_STEP, &payload, true);
        }

        let due = self.last_post_time_sec.map_or(true, |last| {
            ack.server_sec > last.saturating_add(self.config.post_time_interval_secs)
        });
        if due {
            let mut payload = [0u8; 12];
            payload[0..4].copy_from_slice(&local_time.to_le_bytes());
            payload[4..8].copy_from_slice(&ack.server_sec.to_le_bytes());
            payload[8..12].copy_from_slice(&ack.server_usec.to_le_bytes());
            self.log.append_with_retry(EventCode::POST_TIME, &payload, false);
            self.last_post_time_sec = Some(ack.server_sec);
        }
    }
}
