//! Application Layer
//!
//! Use cases of the node: buffering events, persisting them to flash,
//! replicating them to the collector, and operator controls.

pub mod admin;
pub mod event_log;
pub mod flash_store;
pub mod push;

pub use admin::{AdminService, BufferEvents, NodeStatus, LOGGING_PARAM};
pub use event_log::{EventLog, LogConfig, PendingWrite};
pub use flash_store::{FlashConfig, FlashStats, FlashStore, WriteOutcome};
pub use push::{
    frame_request, Chunk, PushAttempt, PushConfig, PushCursor, PushService, SectorHistory,
};
