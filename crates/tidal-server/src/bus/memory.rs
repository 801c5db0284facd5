//! In-memory bus on a tokio broadcast channel.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, error};

use super::{BusStream, ClusterBus};
use crate::errors::BusError;

const CHANNEL_CAPACITY: usize = 1024;

/// Bus shared by cloning. Every clone publishes to and subscribes from the
/// same channel, so one `MemoryBus` can link several adaptors in a process.
#[derive(Clone, Debug)]
pub struct MemoryBus {
    sender: broadcast::Sender<Vec<u8>>,
}

impl MemoryBus {
    /// New, unconnected channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterBus for MemoryBus {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), BusError> {
        // no subscribers is not an error
        match self.sender.send(payload) {
            Ok(receivers) => debug!(receivers, "published to memory bus"),
            Err(_) => debug!("memory bus has no subscribers"),
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<BusStream, BusError> {
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(|item| async move {
            match item {
                Ok(payload) => Some(payload),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    error!(skipped, "memory bus subscriber lagged, messages skipped");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
