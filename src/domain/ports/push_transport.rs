//! Push Transport Port
//!
//! Carries one framed push request to the collector and returns the raw
//! response body.

use crate::domain::errors::PushError;
use async_trait::async_trait;
use bytes::Bytes;

/// Connection factory for the collector.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Block until the network link is usable.
    async fn wait_link_up(&self);

    /// Open a fresh connection. Each exchange uses its own connection.
    async fn connect(&self) -> Result<Box<dyn PushSession>, PushError>;
}

/// A single request/response exchange on an open connection.
#[async_trait]
pub trait PushSession: Send {
    /// Send `request` as the body of a POST and return the response body.
    /// The connection is closed afterwards.
    async fn exchange(self: Box<Self>, request: Bytes) -> Result<Bytes, PushError>;
}
