//! NATS client wrapper for per-instance event channels.
//!
//! Events are fire-and-forget: core NATS only, no JetStream. A message
//! published while the target instance is not subscribed is lost, which is
//! the delivery guarantee the gateway's bus hop promises.

use anyhow::Result;
use async_nats::{Client, Subscriber};
use tracing::{debug, info};

/// Subject prefix for per-instance channels.
pub const INSTANCE_SUBJECT_PREFIX: &str = "wsg.instance.";

/// Subject of the channel owned by `instance_id`.
///
/// Only the instance with that id subscribes to it, so a publish reaches
/// exactly the owner of a connection.
pub fn instance_subject(instance_id: &str) -> String {
    format!("{}{}", INSTANCE_SUBJECT_PREFIX, instance_id)
}

/// Wrapper around the NATS client.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await?;
        Ok(Self { client })
    }

    /// Subscribe to a subject (low-latency push, no polling).
    pub async fn subscribe(&self, subject: &str) -> Result<Subscriber> {
        info!("Subscribing to subject: {}", subject);
        let subscriber = self.client.subscribe(subject.to_string()).await?;
        Ok(subscriber)
    }

    /// Publish a message (fire-and-forget).
    ///
    /// The client buffers writes, so the message is flushed before returning:
    /// callers answer "accepted" only once the bytes left this process.
    pub async fn publish(&self, subject: &str, payload: bytes::Bytes) -> Result<()> {
        debug!(subject, bytes = payload.len(), "publishing");
        self.client.publish(subject.to_string(), payload).await?;
        self.client.flush().await?;
        Ok(())
    }
}
