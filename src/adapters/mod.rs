//! Adapters Layer
//!
//! Inbound adapters expose the node to operators; outbound adapters
//! implement the domain ports against real or simulated hardware.

pub mod inbound;
pub mod outbound;
