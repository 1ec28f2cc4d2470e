//! Redis pub/sub-backed event bus (optional).
//!
//! Pub/sub is not durable: subscribers that are offline miss notifications. That is
//! acceptable for stock alerts, which are advisory and recomputable from the ledger.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use serde_json::Value as JsonValue;
use thiserror::Error;

use dispensary_events::{EventBus, EventEnvelope, Subscription};

use crate::config::LedgerConfig;

#[derive(Debug, Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to start redis publisher: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("redis publisher thread has stopped")]
    PublisherStopped,
}

/// Redis pub/sub bus for JSON event envelopes.
///
/// `publish` only serializes and queues the payload. A dedicated publisher thread owns
/// one connection and does the network I/O, so a slow or unreachable Redis never
/// blocks the caller; delivery failures are logged there and the payload is dropped.
#[derive(Debug, Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    channel: String,
    outbox: mpsc::Sender<String>,
}

impl RedisPubSubEventBus {
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        let channel = channel.into();

        let (outbox, queued) = mpsc::channel();
        let publisher_client = client.clone();
        let publisher_channel = channel.clone();
        thread::Builder::new()
            .name("redis-publisher".to_string())
            .spawn(move || run_publisher(publisher_client, publisher_channel, queued))?;

        Ok(Self {
            client,
            channel,
            outbox,
        })
    }

    /// Bus on `REDIS_URL` / `LEDGER_EVENT_CHANNEL`, or `None` when no Redis is configured.
    pub fn from_config(config: &LedgerConfig) -> Result<Option<Self>, RedisBusError> {
        config
            .redis_url
            .as_deref()
            .map(|url| Self::new(url, config.event_channel.as_str()))
            .transpose()
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

fn encode(envelope: &EventEnvelope<JsonValue>) -> Result<String, RedisBusError> {
    Ok(serde_json::to_string(envelope)?)
}

fn decode(payload: &str) -> Result<EventEnvelope<JsonValue>, serde_json::Error> {
    serde_json::from_str(payload)
}

/// Drain queued payloads onto `channel` over one reused connection.
///
/// Exits once every bus handle is dropped.
fn run_publisher(client: redis::Client, channel: String, queued: mpsc::Receiver<String>) {
    let mut conn: Option<redis::Connection> = None;

    for payload in queued {
        if conn.is_none() {
            match client.get_connection() {
                Ok(c) => conn = Some(c),
                Err(err) => {
                    tracing::warn!(%channel, error = %err, "dropping event: redis unreachable");
                    continue;
                }
            }
        }
        let Some(active) = conn.as_mut() else {
            continue;
        };

        match active.publish::<_, _, i64>(&channel, payload) {
            Ok(receivers) => {
                tracing::debug!(%channel, receivers, "published stock event");
            }
            Err(err) => {
                tracing::warn!(%channel, error = %err, "dropping event: redis publish failed");
                // Reconnect on the next payload.
                conn = None;
            }
        }
    }

    tracing::debug!(%channel, "redis publisher stopped");
}

impl EventBus<EventEnvelope<JsonValue>> for RedisPubSubEventBus {
    type Error = RedisBusError;

    fn publish(&self, message: EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
        let payload = encode(&message)?;
        self.outbox
            .send(payload)
            .map_err(|_| RedisBusError::PublisherStopped)?;
        tracing::trace!(
            channel = %self.channel,
            event_type = message.event_type(),
            "queued stock event"
        );
        Ok(())
    }

    fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let channel = self.channel.clone();

        // Background thread that receives pub/sub messages and forwards them.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(error = %err, "redis subscriber could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(err) = pubsub.subscribe(&channel) {
                tracing::warn!(%channel, error = %err, "redis subscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(err) => {
                        tracing::warn!(%channel, error = %err, "redis subscription closed");
                        return;
                    }
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let envelope = match decode(&payload) {
                    Ok(e) => e,
                    Err(err) => {
                        tracing::debug!(error = %err, "skipping malformed envelope");
                        continue;
                    }
                };

                if tx.send(envelope).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
