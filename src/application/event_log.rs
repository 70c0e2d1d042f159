//! RAM Event Log
//!
//! A small fixed ring of fixed-capacity buffers ("dbufs"). Producers append
//! encoded events to the head buffer; the flash worker copies out whichever
//! buffer is ready to persist and reports back how much it saved.
//!
//! The ring never blocks on I/O. When it fills with unsaved buffers the
//! oldest one is discarded, which is the only backpressure the node has.

use crate::domain::codec::{effective_time, encode_header, CodecState, ERASED};
use crate::domain::entities::EventCode;
use crate::domain::ports::TickSource;
use crate::domain::value_objects::{encode_index_header, AppendOutcome, Segment, INDEX_HEADER_LEN};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// Sizing and flush policy of the ring.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Number of buffers in the ring.
    pub buffer_count: usize,
    /// Capacity of each buffer, equal to the flash sector size.
    pub buffer_size: usize,
    /// Ticks a lone head buffer must stay unchanged before it is flushed.
    pub quiescence_ticks: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            buffer_count: 2,
            buffer_size: 4096,
            // About 120 seconds of the node's RTC counter.
            quiescence_ticks: 20_000_000,
        }
    }
}

/// A buffer copied out for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub index: u32,
    /// Bytes already saved by a previous write; the prefix that need not be
    /// rewritten.
    pub start: usize,
    /// Bytes filled, including the index header.
    pub size: usize,
}

/// One RAM buffer. Keeps `save_size <= size <= capacity` on every update.
struct Dbuf {
    data: Box<[u8]>,
    size: usize,
    save_size: usize,
    /// Time of the oldest content not yet saved.
    write_time: u32,
}

impl Dbuf {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![ERASED; capacity].into_boxed_slice(),
            size: 0,
            save_size: 0,
            write_time: 0,
        }
    }

    fn initialize(&mut self, index: u32, now: u32) {
        self.data.fill(ERASED);
        self.data[..INDEX_HEADER_LEN].copy_from_slice(&encode_index_header(index));
        self.size = INDEX_HEADER_LEN;
        self.save_size = 0;
        self.write_time = now;
    }

    fn index(&self) -> u32 {
        u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn has_room(&self, len: usize) -> bool {
        self.size + len <= self.capacity()
    }

    fn push(&mut self, header: &[u8], payload: &[u8]) {
        let start = self.size;
        let mid = start + header.len();
        let end = mid + payload.len();
        self.data[start..mid].copy_from_slice(header);
        self.data[mid..end].copy_from_slice(payload);
        self.size = end;
    }

    fn mark_saved(&mut self, size: usize, now: u32) {
        self.save_size = size.min(self.size);
        self.write_time = now;
    }

    fn is_saved(&self) -> bool {
        self.save_size == self.size
    }

    fn has_content(&self) -> bool {
        self.size > INDEX_HEADER_LEN
    }
}

struct LogState {
    bufs: Vec<Dbuf>,
    head: usize,
    tail: usize,
    logging_enabled: bool,
    restart_required: bool,
    segment: Segment,
    codec: CodecState,
}

impl LogState {
    fn next_slot(&self, slot: usize) -> usize {
        (slot + 1) % self.bufs.len()
    }

    /// Move to a fresh head buffer with the next index.
    fn rotate(&mut self, now: u32) {
        let index = self.bufs[self.head].index().wrapping_add(1);
        let head = &self.bufs[self.head];
        if self.head != self.tail || !head.is_saved() {
            self.head = self.next_slot(self.head);
            if self.head == self.tail {
                tracing::warn!(
                    "event log full, discarding unsaved buffer {}",
                    self.bufs[self.tail].index()
                );
                self.tail = self.next_slot(self.tail);
            }
        }
        self.bufs[self.head].initialize(index, now);
        self.codec.reset();
        self.segment = self.segment.next();
        self.restart_required = false;
    }
}

/// The RAM Event Log shared by all producers and the flash worker.
pub struct EventLog {
    config: LogConfig,
    state: Mutex<LogState>,
    ticks: Arc<dyn TickSource>,
    flush_wake: Arc<Notify>,
}

impl EventLog {
    /// Create the log with its head buffer at `start_index`.
    ///
    /// The logging flag is set directly so that no marker event is emitted.
    pub fn new(
        config: LogConfig,
        ticks: Arc<dyn TickSource>,
        flush_wake: Arc<Notify>,
        start_index: u32,
        logging_enabled: bool,
    ) -> Self {
        let now = ticks.now();
        let mut bufs: Vec<Dbuf> = (0..config.buffer_count.max(1))
            .map(|_| Dbuf::new(config.buffer_size))
            .collect();
        bufs[0].initialize(start_index, now);

        Self {
            config,
            state: Mutex::new(LogState {
                bufs,
                head: 0,
                tail: 0,
                logging_enabled,
                restart_required: false,
                segment: Segment::default(),
                codec: CodecState::default(),
            }),
            ticks,
            flush_wake,
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Capacity of each buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    /// Append one event to the head buffer.
    ///
    /// `segment` is the continuity epoch the caller's delta state belongs to.
    /// On [`AppendOutcome::Rejected`] the caller resets that state and
    /// retries with the returned segment.
    pub fn append(
        &self,
        segment: Segment,
        code: EventCode,
        payload: &[u8],
        low_res_time: bool,
    ) -> AppendOutcome {
        let mut state = self.state.lock();

        if !state.logging_enabled {
            // The dropped event may have been delta encoded by the caller.
            state.restart_required = true;
            drop(state);
            self.flush_wake.notify_one();
            return AppendOutcome::Discarded;
        }

        // A restart hijacks this call to write the segment start marker. The
        // caller's event is not stored and it retries on the new segment.
        let hijacked = state.restart_required;
        let (segment, code, payload, low_res_time) = if hijacked {
            state.codec.reset();
            state.segment = state.segment.next();
            state.restart_required = false;
            if segment == state.segment {
                tracing::error!("unexpected segment {} on stream restart", segment);
            }
            (state.segment, EventCode::SEGMENT_START, &[0u8; 0][..], true)
        } else {
            (segment, code, payload, low_res_time)
        };

        if segment != state.segment {
            return AppendOutcome::Rejected(state.segment);
        }

        let now = self.ticks.now();
        let time = effective_time(state.codec.last_time(), now, low_res_time);
        let header = encode_header(&state.codec, code, payload.len() as u32, time);
        let total = header.len() + payload.len();

        let capacity = self.config.buffer_size;
        if total > capacity.saturating_sub(INDEX_HEADER_LEN) {
            tracing::error!(
                "event code {} of {} bytes is too large to buffer, dropped",
                code.value(),
                payload.len()
            );
            return if hijacked {
                AppendOutcome::Rejected(state.segment)
            } else {
                AppendOutcome::Discarded
            };
        }

        let head = state.head;
        if !state.bufs[head].has_room(total) {
            state.rotate(now);
            tracing::debug!(
                "event log rotated to buffer {}, segment {}",
                state.bufs[state.head].index(),
                state.segment
            );
            return AppendOutcome::Rejected(state.segment);
        }

        let buf = &mut state.bufs[head];
        if buf.size <= INDEX_HEADER_LEN || buf.is_saved() {
            buf.write_time = time;
        }
        buf.push(header.as_bytes(), payload);
        state.codec.commit(code.value(), payload.len() as u32, time);

        let outcome = if hijacked {
            AppendOutcome::Rejected(state.segment)
        } else {
            AppendOutcome::Accepted
        };
        drop(state);

        self.flush_wake.notify_one();
        outcome
    }

    /// Append from the current segment, retrying through rotations and
    /// stream restarts until the event is settled. Returns the segment the
    /// event was settled in.
    pub fn append_with_retry(&self, code: EventCode, payload: &[u8], low_res_time: bool) -> Segment {
        let mut segment = self.current_segment();
        loop {
            match self.append(segment, code, payload, low_res_time) {
                AppendOutcome::Rejected(next) => segment = next,
                _ => return segment,
            }
        }
    }

    /// Copy out the next buffer that should be persisted.
    ///
    /// Buffers come out in index order: the tail first when more than one is
    /// live, otherwise the head once it has been quiescent long enough. The
    /// whole buffer is copied into `out` because a failed flash write may need
    /// a full rewrite on another sector.
    pub fn buffer_to_write(&self, out: &mut [u8]) -> Option<PendingWrite> {
        let state = self.state.lock();

        let buf = if state.tail != state.head {
            let tail = &state.bufs[state.tail];
            if tail.size <= tail.save_size {
                return None;
            }
            tail
        } else {
            let head = &state.bufs[state.head];
            if !head.has_content() || head.size <= head.save_size {
                return None;
            }
            let idle = self.ticks.now().wrapping_sub(head.write_time);
            if idle <= self.config.quiescence_ticks {
                return None;
            }
            head
        };

        let n = out.len().min(buf.capacity());
        out[..n].copy_from_slice(&buf.data[..n]);
        out[n..].fill(ERASED);

        Some(PendingWrite {
            index: buf.index(),
            start: buf.save_size,
            size: buf.size,
        })
    }

    /// Record that `index` has been durably saved up to `size` bytes, then
    /// free fully saved buffers from the tail. Unknown indices are ignored;
    /// the buffer has already wrapped out of the ring.
    pub fn note_buffer_written(&self, index: u32, size: usize) {
        let now = self.ticks.now();
        let mut state = self.state.lock();

        let mut slot = state.tail;
        loop {
            if state.bufs[slot].index() == index {
                break;
            }
            if slot == state.head {
                tracing::debug!("buffer {} no longer in the event log", index);
                return;
            }
            slot = state.next_slot(slot);
        }

        state.bufs[slot].mark_saved(size, now);

        while state.tail != state.head && state.bufs[state.tail].is_saved() {
            state.tail = state.next_slot(state.tail);
        }
    }

    /// Index of the buffer currently being written.
    pub fn head_index(&self) -> u32 {
        let state = self.state.lock();
        state.bufs[state.head].index()
    }

    pub fn current_segment(&self) -> Segment {
        self.state.lock().segment
    }

    /// Discard all buffered content and restart at index 0. The next append
    /// starts a new segment.
    pub fn reset(&self) {
        let now = self.ticks.now();
        let mut state = self.state.lock();
        state.head = 0;
        state.tail = 0;
        state.bufs[0].initialize(0, now);
        state.codec.reset();
        state.restart_required = true;
    }

    pub fn logging_enabled(&self) -> bool {
        self.state.lock().logging_enabled
    }

    /// Pause or resume logging, returning the previous setting.
    ///
    /// Pausing logs a PAUSE_LOGGING marker first. Resuming logs a
    /// START_LOGGING marker with the tick calibration, preceded by a segment
    /// start.
    pub fn set_logging(&self, enable: bool) -> bool {
        if !enable && self.logging_enabled() {
            self.append_with_retry(EventCode::PAUSE_LOGGING, &[], true);
        }

        let old = {
            let mut state = self.state.lock();
            let old = state.logging_enabled;
            state.logging_enabled = enable;
            if old && !enable {
                state.restart_required = true;
            }
            old
        };

        if !old && enable {
            let calibration = self.ticks.calibration().to_le_bytes();
            self.append_with_retry(EventCode::START_LOGGING, &calibration, true);
        }

        if old != enable {
            tracing::info!("event logging {}", if enable { "resumed" } else { "paused" });
        }
        old
    }

    /// Log the node STARTUP event with the boot reason and tick calibration.
    pub fn note_startup(&self, reason: u32) {
        let mut payload = [0u8; 8];
        payload[0..4].copy_from_slice(&reason.to_le_bytes());
        payload[4..8].copy_from_slice(&self.ticks.calibration().to_le_bytes());
        self.append_with_retry(EventCode::STARTUP, &payload, true);
    }

    /// Indices of the live buffers from tail to head.
    #[cfg(test)]
    fn live_indices(&self) -> Vec<u32> {
        let state = self.state.lock();
        let mut out = Vec::new();
        let mut slot = state.tail;
        loop {
            out.push(state.bufs[slot].index());
            if slot == state.head {
                return out;
            }
            slot = state.next_slot(slot);
        }
    }
}
