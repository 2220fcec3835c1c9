//! NATS-backed event bus. Instance channels are `wsg.instance.{instance_id}`.

use async_trait::async_trait;
use futures::StreamExt;
use nats_client::{instance_subject, NatsClient};
use tracing::{debug, info};

use super::{EventBus, EventStream};
use crate::error::Result;
use crate::protocol::Event;

#[derive(Clone)]
pub struct NatsBus {
    client: NatsClient,
}

impl NatsBus {
    pub fn new(client: NatsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, instance_id: &str, event: &Event) -> Result<()> {
        let subject = instance_subject(instance_id);
        self.client.publish(&subject, event.encode()?).await?;
        debug!(
            subject = %subject,
            connection_id = event.connection_id(),
            kind = event.kind(),
            "Published event"
        );
        Ok(())
    }

    async fn subscribe(&self, instance_id: &str) -> Result<EventStream> {
        let subject = instance_subject(instance_id);
        let subscriber = self.client.subscribe(&subject).await?;
        info!(subject = %subject, "Subscribed to instance channel");
        Ok(subscriber.map(|message| message.payload).boxed())
    }
}
