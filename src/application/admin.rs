//! Admin Service - operator controls and diagnostics
//!
//! Pause/resume of logging, factory erase, and read-only views of the
//! flash history for the admin API.

use crate::application::event_log::EventLog;
use crate::application::flash_store::{FlashStats, FlashStore};
use crate::domain::codec::decode_events;
use crate::domain::entities::{BufferSize, Event};
use crate::domain::ports::ParamStore;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;

/// Parameter key holding the persisted logging flag.
pub const LOGGING_PARAM: &str = "logging";

/// Decoded content of one flash buffer.
#[derive(Debug, Clone, Serialize)]
pub struct BufferEvents {
    pub index: u32,
    pub sealed: bool,
    pub events: Vec<Event>,
    /// Set when decoding stopped at a damaged event.
    pub error: Option<String>,
}

/// Snapshot of the pipeline for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub logging: bool,
    pub head_index: u32,
    pub segment: u32,
    pub flash: FlashStats,
}

pub struct AdminService {
    log: Arc<EventLog>,
    store: Arc<FlashStore>,
    params: Arc<dyn ParamStore>,
}

impl AdminService {
    pub fn new(log: Arc<EventLog>, store: Arc<FlashStore>, params: Arc<dyn ParamStore>) -> Self {
        Self { log, store, params }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            logging: self.log.logging_enabled(),
            head_index: self.log.head_index(),
            segment: self.log.current_segment().value(),
            flash: self.store.stats(),
        }
    }

    pub fn logging_enabled(&self) -> bool {
        self.log.logging_enabled()
    }

    /// Pause or resume logging and persist the choice. Returns the previous
    /// setting.
    pub fn set_logging(&self, enabled: bool) -> bool {
        self.params.set_bool(LOGGING_PARAM, enabled);
        self.log.set_logging(enabled)
    }

    /// Erase the whole flash history. Logging is paused and the RAM log
    /// reset for the duration, then the previous logging state restored.
    pub fn erase_all(&self) -> bool {
        let logging = self.log.set_logging(false);
        self.log.reset();
        let erased = self.store.erase_all();
        self.log.set_logging(logging);
        if !erased {
            tracing::warn!("flash erase left some sectors dirty");
        }
        erased
    }

    /// Size query; `None` asks for the newest index.
    pub fn buffer_size(&self, index: Option<u32>) -> BufferSize {
        self.store.get_buffer_size(index.unwrap_or(u32::MAX))
    }

    /// Bytes `[start, end)` of exactly `index`, clamped to its content size.
    pub fn buffer_range(&self, index: u32, start: Option<usize>, end: Option<usize>) -> Option<Bytes> {
        let found = self.store.get_buffer_size(index);
        if found.index != index || found.size == 0 {
            return None;
        }
        let size = found.size as usize;
        let start = start.unwrap_or(0).min(size);
        let end = end.unwrap_or(size).min(size).max(start);
        self.store.get_buffer_range(index, start, end)
    }

    /// Decode the events stored under exactly `index`.
    pub fn buffer_events(&self, index: u32) -> Option<BufferEvents> {
        let found = self.store.get_buffer_size(index);
        if found.index != index || found.size == 0 {
            return None;
        }
        let bytes = self.store.get_buffer_range(index, 0, found.size as usize)?;

        let mut events = Vec::new();
        let mut error = None;
        for decoded in decode_events(&bytes) {
            match decoded {
                Ok(event) => events.push(event.to_event()),
                Err(e) => error = Some(e.to_string()),
            }
        }
        Some(BufferEvents {
            index,
            sealed: found.sealed,
            events,
            error,
        })
    }
}
