//! Flash Persistence Layer
//!
//! Snapshots RAM buffers into a ring of flash sectors. Every sector starts
//! with the redundant index header of the buffer it holds, which is all the
//! state needed to find the ring head again after a restart.
//!
//! A write to a sector that already holds the same index only programs the
//! new suffix. Anything else goes to the next sector. Failed writes are
//! retried on following sectors with the same index, so the recovery scan
//! prefers the last of several sectors sharing the largest index.

use crate::application::event_log::EventLog;
use crate::application::push::SectorHistory;
use crate::domain::codec::ERASED;
use crate::domain::entities::BufferSize;
use crate::domain::errors::FlashError;
use crate::domain::ports::FlashDevice;
use crate::domain::value_objects::{decode_index_header, INDEX_HEADER_LEN};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Notify;

/// Placement and retry policy of the sector ring.
#[derive(Debug, Clone)]
pub struct FlashConfig {
    /// First device sector used by the ring.
    pub first_sector: u32,
    /// Number of sectors in the ring.
    pub num_sectors: u32,
    /// Sectors scanned past the newest one for a retried duplicate.
    pub recovery_window: u32,
    /// Failed sector writes tolerated before a buffer is abandoned.
    pub write_retries: u32,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            first_sector: 0,
            num_sectors: 64,
            recovery_window: 128,
            write_retries: 8,
        }
    }
}

/// Result of persisting one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Written and verified at this ring slot.
    Written { sector: u32 },
    /// Every attempt failed; the buffer is treated as saved anyway.
    Abandoned,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlashStats {
    pub head_sector: u32,
    pub head_initialized: bool,
    pub write_failures: u64,
    pub invalidate_failures: u64,
}

/// Ring-relative sector arithmetic.
#[derive(Debug, Clone, Copy)]
struct Ring {
    first: u32,
    count: u32,
    sector_size: usize,
}

impl Ring {
    fn next(&self, slot: u32) -> u32 {
        if slot + 1 >= self.count {
            0
        } else {
            slot + 1
        }
    }

    fn prev(&self, slot: u32) -> u32 {
        if slot == 0 {
            self.count - 1
        } else {
            slot - 1
        }
    }

    fn device_sector(&self, slot: u32) -> u32 {
        self.first + slot
    }

    fn addr(&self, slot: u32) -> u32 {
        self.device_sector(slot) * self.sector_size as u32
    }
}

struct FlashState {
    device: Box<dyn FlashDevice>,
    ring: Ring,
    /// Ring slot of the head sector.
    sector: u32,
    /// The head sector has been written since init or the last advance.
    initialized: bool,
    scratch: Vec<u8>,
    range_cache: Option<(u32, u32)>,
    maybe_more: bool,
    write_failures: u64,
    invalidate_failures: u64,
}

impl FlashState {
    fn read_index(&mut self, slot: u32) -> Option<u32> {
        let mut header = [0u8; INDEX_HEADER_LEN];
        self.device.read(self.ring.addr(slot), &mut header).ok()?;
        decode_index_header(&header)
    }

    fn read_sector(&mut self, slot: u32) -> Result<(), FlashError> {
        let addr = self.ring.addr(slot);
        self.device.read(addr, &mut self.scratch)
    }

    fn is_erased(&mut self, slot: u32) -> bool {
        self.read_sector(slot).is_ok() && self.scratch.iter().all(|b| *b == ERASED)
    }

    fn verify(&mut self, slot: u32, expected: &[u8]) -> bool {
        self.read_sector(slot).is_ok() && self.scratch[..] == expected[..]
    }

    /// Content size of a sector with the trailing erased bytes stripped.
    fn trimmed_size(&mut self, slot: u32) -> Result<u32, FlashError> {
        self.read_sector(slot)?;
        let size = self
            .scratch
            .iter()
            .rposition(|b| *b != ERASED)
            .map_or(0, |last| last + 1);
        Ok(size as u32)
    }

    fn read_range(&mut self, slot: u32, start: usize, end: usize) -> Option<Bytes> {
        let mut out = vec![0u8; end - start];
        self.device
            .read(self.ring.addr(slot) + start as u32, &mut out)
            .ok()?;
        Some(Bytes::from(out))
    }

    fn advance(&mut self) {
        self.sector = self.ring.next(self.sector);
        self.initialized = false;
    }

    /// Give up on the head sector after a failed erase or write.
    fn handle_failure(&mut self) {
        self.write_failures += 1;
        let slot = self.sector;
        if self.read_index(slot).is_some() {
            // Invalidate a partially written index so it is never trusted.
            let erased = self.device.erase_sector(self.ring.device_sector(slot));
            if erased.is_err() || self.read_index(slot).is_some() {
                self.invalidate_failures += 1;
                tracing::error!("failed to invalidate flash sector {}", slot);
            }
        }
        self.advance();
    }

    /// Write a full buffer to the head sector, erasing first if needed.
    fn write_fresh(&mut self, buf: &[u8], len: usize) -> bool {
        let slot = self.sector;
        let sector = self.ring.device_sector(slot);
        if !self.is_erased(slot) {
            // A failed erase falls through; the write might still verify.
            if self.device.erase_sector(sector).is_err() || !self.is_erased(slot) {
                tracing::debug!("flash sector {} did not erase cleanly", slot);
            }
        }
        self.device.write(self.ring.addr(slot), &buf[..len]).is_ok() && self.verify(slot, buf)
    }
}

/// The Flash Persistence Layer.
pub struct FlashStore {
    config: FlashConfig,
    state: Mutex<FlashState>,
    push_wake: Arc<Notify>,
}

fn align_down(n: usize) -> usize {
    n & !3
}

fn align_up(n: usize) -> usize {
    (n + 3) & !3
}

impl FlashStore {
    /// Wrap a device. The ring must fit on the device and hold at least two
    /// sectors. Call [`FlashStore::init`] before writing.
    pub fn new(
        device: Box<dyn FlashDevice>,
        config: FlashConfig,
        push_wake: Arc<Notify>,
    ) -> Result<Self, FlashError> {
        let sector_size = device.sector_size();
        let end = config.first_sector as u64 + config.num_sectors as u64;
        if end > device.sector_count() as u64 {
            return Err(FlashError::OutOfRange {
                addr: config.first_sector.saturating_mul(sector_size as u32),
                len: config.num_sectors as usize * sector_size,
            });
        }
        if config.num_sectors < 2 {
            return Err(FlashError::Device(
                "flash ring needs at least two sectors".to_string(),
            ));
        }

        let ring = Ring {
            first: config.first_sector,
            count: config.num_sectors,
            sector_size,
        };
        Ok(Self {
            state: Mutex::new(FlashState {
                device,
                ring,
                sector: 0,
                initialized: false,
                scratch: vec![ERASED; sector_size],
                range_cache: None,
                maybe_more: true,
                write_failures: 0,
                invalidate_failures: 0,
            }),
            config,
            push_wake,
        })
    }

    pub fn sector_size(&self) -> usize {
        self.state.lock().ring.sector_size
    }

    /// Recover the ring head. Returns the index the next buffer should use.
    ///
    /// The head moves to the sector after the newest one and is left
    /// uninitialized, so every boot starts a fresh sector.
    pub fn init(&self) -> u32 {
        let mut state = self.state.lock();
        let count = state.ring.count;

        let mut newest: Option<(u32, u32)> = None;
        for slot in 0..count {
            if let Some(index) = state.read_index(slot) {
                if newest.map_or(true, |(_, best)| index >= best) {
                    newest = Some((slot, index));
                }
            }
        }

        let next_index = match newest {
            Some((mut head, index)) => {
                let mut slot = head;
                // Never scan far enough to wrap back onto older copies.
                for _ in 0..self.config.recovery_window.min(count / 2) {
                    slot = state.ring.next(slot);
                    if state.read_index(slot) == Some(index) {
                        head = slot;
                    }
                }
                state.sector = state.ring.next(head);
                tracing::info!(
                    "flash ring recovered: newest index {} at sector {}",
                    index,
                    head
                );
                index.wrapping_add(1)
            }
            None => {
                state.sector = 0;
                tracing::info!("flash ring has no valid sectors, starting at index 0");
                0
            }
        };
        state.initialized = false;
        state.range_cache = None;
        next_index
    }

    /// Persist a buffer copied out of the event log.
    ///
    /// `buf` is the whole buffer image, exactly one sector long, `start` the
    /// bytes saved by earlier writes and `size` the bytes filled. Device
    /// failures never surface as errors; they follow the retry and abandon
    /// policy.
    pub fn write(&self, buf: &[u8], start: usize, size: usize) -> Result<WriteOutcome, FlashError> {
        let mut state = self.state.lock();
        let sector_size = state.ring.sector_size;
        if buf.len() != sector_size {
            return Err(FlashError::BufferSize {
                expected: sector_size,
                actual: buf.len(),
            });
        }
        let index = decode_index_header(buf).ok_or(FlashError::MissingIndex)?;
        let size = size.min(sector_size);
        let end = align_up(size).min(sector_size);

        if state.initialized {
            let slot = state.sector;
            if state.read_index(slot) == Some(index) {
                let from = align_down(start.min(size));
                let addr = state.ring.addr(slot) + from as u32;
                let written = state.device.write(addr, &buf[from..end]).is_ok();
                if written && state.verify(slot, buf) {
                    state.maybe_more = true;
                    return Ok(WriteOutcome::Written { sector: slot });
                }
                tracing::warn!("rewrite of buffer {} at sector {} failed", index, slot);
                state.handle_failure();
            } else {
                state.advance();
            }
        }

        let mut failures = 0;
        let outcome = loop {
            if state.write_fresh(buf, end) {
                state.initialized = true;
                break WriteOutcome::Written { sector: state.sector };
            }
            tracing::warn!("write of buffer {} at sector {} failed", index, state.sector);
            state.handle_failure();
            failures += 1;
            if failures > self.config.write_retries {
                tracing::warn!("abandoning buffer {} after {} failed writes", index, failures);
                break WriteOutcome::Abandoned;
            }
        };
        state.maybe_more = true;
        Ok(outcome)
    }

    /// Persist every buffer the event log has ready, acknowledging each one
    /// back to the log. Returns the number of buffers handled.
    pub fn flush_pending(&self, log: &EventLog) -> usize {
        let mut buf = vec![ERASED; self.sector_size()];
        let mut flushed = 0;
        while let Some(pending) = log.buffer_to_write(&mut buf) {
            match self.write(&buf, pending.start, pending.size) {
                Ok(WriteOutcome::Written { sector }) => {
                    tracing::debug!(
                        "buffer {} saved to sector {} ({} bytes)",
                        pending.index,
                        sector,
                        pending.size
                    );
                }
                Ok(WriteOutcome::Abandoned) => {}
                Err(e) => {
                    // Acknowledged like an abandoned write so the tail can retire.
                    tracing::warn!("dropping buffer {}: {}", pending.index, e);
                }
            }
            log.note_buffer_written(pending.index, pending.size);
            self.push_wake.notify_one();
            flushed += 1;
        }
        flushed
    }

    /// Size of the sector holding `requested`, or of the nearest older one.
    ///
    /// Falls back to the oldest sector found when every stored index is
    /// newer than `requested`, and to an empty answer when the ring is empty.
    pub fn get_buffer_size(&self, requested: u32) -> BufferSize {
        let mut state = self.state.lock();
        let head = state.sector;

        // Newest sector seen so far, and the index after it.
        let mut last: Option<(u32, u32)> = None;
        let mut next_index: Option<u32> = None;

        if state.initialized {
            if let Some(index) = state.read_index(head) {
                last = Some((head, index));
                if index <= requested {
                    if let Ok(size) = state.trimmed_size(head) {
                        return BufferSize {
                            size,
                            index,
                            next_index: None,
                            sealed: false,
                        };
                    }
                }
            }
        }

        // An unwritten head slot still holds the oldest buffer of the ring.
        let scan = if state.initialized {
            state.ring.count - 1
        } else {
            state.ring.count
        };
        let mut slot = head;
        for _ in 0..scan {
            slot = state.ring.prev(slot);
            if let Some(index) = state.read_index(slot) {
                // Skip regressions and stale retries of a newer index.
                if last.map_or(true, |(_, newer)| index < newer) {
                    if index <= requested {
                        if let Ok(size) = state.trimmed_size(slot) {
                            return BufferSize {
                                size,
                                index,
                                next_index: last.map(|(_, newer)| newer),
                                sealed: true,
                            };
                        }
                    } else {
                        next_index = last.map(|(_, newer)| newer);
                        last = Some((slot, index));
                    }
                }
            }
        }

        if let Some((slot, index)) = last {
            if let Ok(size) = state.trimmed_size(slot) {
                return BufferSize {
                    size,
                    index,
                    next_index,
                    sealed: slot != head || !state.initialized,
                };
            }
        }
        BufferSize::empty()
    }

    /// Read `[start, end)` of the sector holding `index`, clamped to the
    /// sector. `None` means the index is no longer in the ring.
    pub fn get_buffer_range(&self, index: u32, start: usize, end: usize) -> Option<Bytes> {
        let mut state = self.state.lock();
        let end = end.min(state.ring.sector_size);
        let start = start.min(end);

        if let Some((slot, cached)) = state.range_cache {
            if cached == index && state.read_index(slot) == Some(index) {
                if let Some(bytes) = state.read_range(slot, start, end) {
                    return Some(bytes);
                }
            }
        }

        let head = state.sector;
        if state.initialized && state.read_index(head) == Some(index) {
            if let Some(bytes) = state.read_range(head, start, end) {
                state.range_cache = Some((head, index));
                return Some(bytes);
            }
        }

        let scan = if state.initialized {
            state.ring.count - 1
        } else {
            state.ring.count
        };
        let mut slot = head;
        for _ in 0..scan {
            slot = state.ring.prev(slot);
            if state.read_index(slot) == Some(index) {
                if let Some(bytes) = state.read_range(slot, start, end) {
                    state.range_cache = Some((slot, index));
                    return Some(bytes);
                }
            }
        }

        state.range_cache = None;
        None
    }

    /// Erase every sector of the ring and restart at its first sector.
    /// Returns false if some sector did not erase cleanly.
    ///
    /// The event log must be paused and reset around this call.
    pub fn erase_all(&self) -> bool {
        let mut state = self.state.lock();
        let mut success = true;
        for slot in 0..state.ring.count {
            if !state.is_erased(slot) {
                let sector = state.ring.device_sector(slot);
                if state.device.erase_sector(sector).is_err() || !state.is_erased(slot) {
                    tracing::error!("failed to erase flash sector {}", slot);
                    success = false;
                }
            }
        }
        state.sector = 0;
        state.initialized = false;
        state.maybe_more = false;
        state.range_cache = None;
        tracing::info!("flash ring erased");
        success
    }

    /// True when a write may have produced data the push worker has not
    /// looked at yet.
    pub fn maybe_more(&self) -> bool {
        self.state.lock().maybe_more
    }

    pub fn clear_maybe_more(&self) {
        self.state.lock().maybe_more = false;
    }

    pub fn stats(&self) -> FlashStats {
        let state = self.state.lock();
        FlashStats {
            head_sector: state.sector,
            head_initialized: state.initialized,
            write_failures: state.write_failures,
            invalidate_failures: state.invalidate_failures,
        }
    }
}

impl SectorHistory for FlashStore {
    fn sector_size(&self) -> usize {
        FlashStore::sector_size(self)
    }

    fn buffer_size(&self, requested: u32) -> BufferSize {
        self.get_buffer_size(requested)
    }

    fn buffer_range(&self, index: u32, start: usize, end: usize) -> Option<Bytes> {
        self.get_buffer_range(index, start, end)
    }

    fn maybe_more(&self) -> bool {
        FlashStore::maybe_more(self)
    }

    fn clear_maybe_more(&self) {
        FlashStore::clear_maybe_more(self)
    }
}
