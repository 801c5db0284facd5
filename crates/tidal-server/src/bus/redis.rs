//! Redis pub/sub bus.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{info, warn};

use super::{BusStream, ClusterBus};
use crate::errors::BusError;

/// Bus over one Redis pub/sub channel.
///
/// Publishing goes through a reconnecting [`ConnectionManager`]; each
/// subscription opens its own pub/sub connection.
pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
    channel: String,
}

impl RedisBus {
    /// Connect to `url` and use `channel` for every message.
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, BusError> {
        let client = Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let channel = channel.into();
        info!(url = %url, channel = %channel, "connected to redis bus");
        Ok(Self {
            client,
            publisher,
            channel,
        })
    }

    /// Channel name in use.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl ClusterBus for RedisBus {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), BusError> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(&self.channel, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self) -> Result<BusStream, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        let channel = self.channel.clone();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let channel = channel.clone();
            async move {
                match msg.get_payload::<Vec<u8>>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "unreadable redis payload");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
