//! sensor-log Library
//!
//! Telemetry durability pipeline of a sensor node: a RAM event log, a
//! wear-levelled flash sector ring, and authenticated replication of the
//! flash history to a remote collector.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{AdminService, EventLog, FlashStore, PushService};
pub use config::{load_config, Config};
pub use domain::codec::decode_events;
pub use domain::entities::{BufferSize, Event, EventCode};
pub use domain::ports::{FlashDevice, ParamStore, PushTransport, TickSource, WallClock};
pub use domain::value_objects::{AppendOutcome, Segment};
pub use infrastructure::ShutdownController;
