//! Cross-process message bus used by the cluster adaptor.
//!
//! A bus moves opaque payloads between every node subscribed to it.
//! Implementations:
//! - [`MemoryBus`]: tokio broadcast channel, for tests and single-process clusters
//! - [`RedisBus`]: Redis pub/sub (feature `redis`)

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::BusError;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryBus;
#[cfg(feature = "redis")]
pub use self::redis::RedisBus;

/// Stream of payloads received from the bus.
pub type BusStream = BoxStream<'static, Vec<u8>>;

/// Publish/subscribe transport between nodes.
///
/// Publishers also receive their own payloads; filtering is up to the subscriber.
#[async_trait]
pub trait ClusterBus: Send + Sync {
    /// Send a payload to every subscriber.
    async fn publish(&self, payload: Vec<u8>) -> Result<(), BusError>;

    /// Start receiving payloads published after this call.
    async fn subscribe(&self) -> Result<BusStream, BusError>;
}
