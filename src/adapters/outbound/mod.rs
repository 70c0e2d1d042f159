mod dashmap_param_store;
mod file_flash;
mod http_push_transport;
mod mem_flash;
mod system_clock;
mod tick_source;

pub use dashmap_param_store::DashMapParamStore;
pub use file_flash::FileFlash;
pub use http_push_transport::{HttpPushConfig, HttpPushTransport};
pub use mem_flash::MemFlash;
pub use system_clock::SystemWallClock;
pub use tick_source::{CounterTickSource, ManualTickSource};
