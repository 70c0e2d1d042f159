//! Domain Layer
//!
//! Event encoding, buffer identity, and the ports the application layer
//! drives. Nothing in here touches I/O directly.

pub mod codec;
pub mod entities;
pub mod errors;
pub mod ports;
pub mod value_objects;
