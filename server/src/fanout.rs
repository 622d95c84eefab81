use anyhow::Result;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;
use wagerboard_types::{LiveMessage, Topic};

use crate::broadcaster::Broadcaster;

const MAX_FANOUT_ORIGIN_LEN: usize = 64;
const MAX_FANOUT_PAYLOAD_BYTES: usize = 8 * 1024 * 1024;
const FANOUT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Wire form of a live update relayed between instances.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct FanoutEnvelope {
    origin: String,
    topic: Topic,
    payload: String,
}

impl FanoutEnvelope {
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_FANOUT_PAYLOAD_BYTES {
            anyhow::bail!("fanout envelope too large: {} bytes", bytes.len());
        }
        let envelope: Self = serde_json::from_slice(bytes)?;
        if envelope.origin.len() > MAX_FANOUT_ORIGIN_LEN {
            anyhow::bail!("fanout origin too long");
        }
        Ok(envelope)
    }
}

/// Relays live updates over redis pub/sub so every instance can notify its
/// own subscribers. Messages carrying this instance's origin are ignored.
pub struct Fanout {
    origin: String,
    channel: String,
    publish: bool,
    subscribe: bool,
    client: redis::Client,
    publisher: Mutex<Option<redis::aio::ConnectionManager>>,
}

impl Fanout {
    pub fn new(
        url: &str,
        channel: String,
        origin: Option<String>,
        publish: bool,
        subscribe: bool,
    ) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let origin = origin
            .map(|origin| origin.chars().take(MAX_FANOUT_ORIGIN_LEN).collect())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Self {
            origin,
            channel,
            publish,
            subscribe,
            client,
            publisher: Mutex::new(None),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn start(self: &Arc<Self>, broadcaster: Arc<Broadcaster>) {
        if !self.subscribe {
            return;
        }
        let fanout = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(err) = fanout.run_subscriber(&broadcaster).await {
                    tracing::warn!("Fanout subscriber error: {err}");
                }
                tokio::time::sleep(FANOUT_RECONNECT_DELAY).await;
            }
        });
    }

    pub async fn publish(&self, message: &LiveMessage) {
        if !self.publish {
            return;
        }
        let Some(topic) = message.topic() else {
            return;
        };
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("Fanout payload encode failed: {err}");
                return;
            }
        };
        if payload.len() > MAX_FANOUT_PAYLOAD_BYTES {
            tracing::warn!(
                len = payload.len(),
                "Skipping fanout publish: payload exceeds max size"
            );
            return;
        }
        let envelope = FanoutEnvelope {
            origin: self.origin.clone(),
            topic,
            payload,
        };
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!("Fanout envelope encode failed: {err}");
                return;
            }
        };
        let mut guard = match self.ensure_publisher().await {
            Ok(guard) => guard,
            Err(err) => {
                tracing::warn!("Fanout publisher connection failed: {err}");
                return;
            }
        };
        let Some(conn) = guard.as_mut() else {
            return;
        };
        let result: redis::RedisResult<()> = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(bytes)
            .query_async(conn)
            .await;
        if let Err(err) = result {
            tracing::warn!("Fanout publish failed: {err}");
            *guard = None;
        }
    }

    async fn ensure_publisher(
        &self,
    ) -> Result<
        tokio::sync::MutexGuard<'_, Option<redis::aio::ConnectionManager>>,
        redis::RedisError,
    > {
        let mut guard = self.publisher.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.get_connection_manager().await?);
        }
        Ok(guard)
    }

    async fn run_subscriber(&self, broadcaster: &Broadcaster) -> Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        tracing::info!(channel = %self.channel, origin = %self.origin, "Fanout subscriber connected");
        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let payload: Vec<u8> = match message.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!("Fanout message decode failed: {err}");
                    continue;
                }
            };
            self.deliver(broadcaster, &payload);
        }
        Ok(())
    }

    fn deliver(&self, broadcaster: &Broadcaster, bytes: &[u8]) -> Option<usize> {
        let envelope = match FanoutEnvelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!("Fanout envelope decode failed: {err}");
                return None;
            }
        };
        if envelope.origin == self.origin {
            return None;
        }
        Some(broadcaster.notify(envelope.topic, envelope.payload.into()))
    }
}
