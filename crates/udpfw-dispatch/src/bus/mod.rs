//! Pub/sub substrate used to exchange envelopes between dispatch
//! instances.
//!
//! The server depends only on the [`Bus`] trait; concrete backends
//! (a Redis channel, a NATS subject) plug in behind it. [`MemoryBus`]
//! is the in-process implementation used for single-instance
//! deployments and tests.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

mod memory;

pub use memory::MemoryBus;

#[derive(Debug, Error)]
pub enum BusError {
    /// The bus was shut down. Consumers treat this as a clean stop.
    #[error("bus closed")]
    Closed,
    #[error("bus is already running")]
    AlreadyRunning,
    #[error("publish called on an inactive bus")]
    NotRunning,
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn start(&self) -> Result<(), BusError>;

    /// Broadcast an encoded envelope to every subscriber, including the
    /// publishing instance itself.
    async fn publish(&self, data: Bytes) -> Result<(), BusError>;

    /// Next envelope delivered by the subscription. Returns
    /// [`BusError::Closed`] once the bus has shut down.
    async fn next(&self) -> Result<Bytes, BusError>;

    async fn shutdown(&self) -> Result<(), BusError>;
}
