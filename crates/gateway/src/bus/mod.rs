//! Instance-to-instance event bus.
//!
//! Every instance subscribes to its own channel, named by its instance id. An
//! instance that needs to reach a connection it does not hold publishes the
//! event on the owner's channel. Delivery is at-most-once.

mod memory;
mod nats;

pub use self::memory::MemoryBus;
pub use self::nats::NatsBus;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::protocol::Event;

/// Raw encoded events arriving on an instance's channel.
pub type EventStream = BoxStream<'static, Bytes>;

#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Encode and publish an event on the given instance's channel.
    async fn publish(&self, instance_id: &str, event: &Event) -> Result<()>;

    /// Subscribe to an instance's channel. Dropping the stream unsubscribes.
    async fn subscribe(&self, instance_id: &str) -> Result<EventStream>;
}
