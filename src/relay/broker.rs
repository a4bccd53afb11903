use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use log::info;

use crate::error::{HubError, Result};
use crate::relay::{RelayEnvelope, RelaySource};

/// Redis pub/sub as the cross-process broker.
pub struct RedisRelaySource {
    url: String,
    connect_timeout: Duration,
}

impl RedisRelaySource {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl RelaySource for RedisRelaySource {
    async fn subscribe(&self, channels: &[String]) -> Result<BoxStream<'static, RelayEnvelope>> {
        let client = redis::Client::open(self.url.as_str())?;
        let mut pubsub = tokio::time::timeout(self.connect_timeout, client.get_async_pubsub())
            .await
            .map_err(|_| {
                HubError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("redis connect timed out after {:?}", self.connect_timeout),
                ))
            })??;

        for channel in channels {
            pubsub.subscribe(channel.as_str()).await?;
        }
        info!("Subscribed to redis channels {:?}", channels);

        let messages = pubsub.into_on_message().map(|msg| RelayEnvelope {
            channel: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(messages.boxed())
    }
}
