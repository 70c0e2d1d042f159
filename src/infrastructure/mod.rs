//! Infrastructure Layer
//!
//! Worker loops, retry policy, and shutdown coordination.

pub mod backoff;
pub mod shutdown;
pub mod workers;

pub use backoff::{BackoffConfig, HoldOff};
pub use shutdown::{shutdown_signal, ShutdownController, WorkerGuard};
pub use workers::{spawn_flash_worker, spawn_push_worker, FlashWorkerConfig, PushWorkerConfig};
