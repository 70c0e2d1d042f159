mod clock;
mod flash_device;
mod param_store;
mod push_transport;

pub use clock::{TickSource, WallClock};
pub use flash_device::FlashDevice;
pub use param_store::ParamStore;
pub use push_transport::{PushSession, PushTransport};
