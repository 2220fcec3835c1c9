//! In-process event bus for single-instance deployments and tests.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::{EventBus, EventStream};
use crate::error::Result;
use crate::protocol::Event;

#[derive(Default)]
pub struct MemoryBus {
    channels: DashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions on an instance's channel.
    pub fn subscriber_count(&self, instance_id: &str) -> usize {
        self.channels
            .get(instance_id)
            .map(|subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, instance_id: &str, event: &Event) -> Result<()> {
        let raw = event.encode()?;
        // Nobody listening means the event is lost, as on a real bus.
        if let Some(mut subscribers) = self.channels.get_mut(instance_id) {
            subscribers.retain(|tx| tx.send(raw.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, instance_id: &str) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .entry(instance_id.to_owned())
            .or_default()
            .push(tx);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|raw| (raw, rx))
        });
        Ok(stream.boxed())
    }
}
