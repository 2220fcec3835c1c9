//! Event router: gets instructions to connections wherever they live.
//!
//! The HTTP handlers call [`EventRouter::write`] and
//! [`EventRouter::drop_connection`]. A connection held by this instance gets
//! the instruction through the registry. Otherwise the locator names the
//! owning instance and the instruction is published on its bus channel.
//!
//! [`EventRouter::run`] is the receiving end: it reads this instance's bus
//! channel and hands each event to the local connection it names.
//!
//! ```text
//! POST / DELETE ──▶ registry ──hit──▶ connection relay
//!                      │miss
//!                      ▼
//!                   locator ──owner──▶ bus ──▶ owner's EventRouter::run ──▶ registry
//! ```

use std::sync::Arc;

use futures::StreamExt;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, EventStream};
use crate::error::{GatewayError, Result};
use crate::locator::Locator;
use crate::protocol::{Event, Frame, Outbound};
use crate::registry::{ConnectionRegistry, Delivery};

/// Where a routed instruction went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Handed to a connection on this instance.
    Local,
    /// Published to the owning instance.
    Remote { instance_id: String },
    /// No live lease anywhere.
    NotFound,
}

/// What the subscriber did with one bus event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    /// The named connection is not (or no longer) open here.
    Unknown,
    /// The event could not be decoded.
    Rejected,
}

pub struct EventRouter {
    instance_id: String,
    registry: Arc<ConnectionRegistry>,
    locator: Arc<dyn Locator>,
    bus: Arc<dyn EventBus>,
}

impl EventRouter {
    pub fn new(
        instance_id: impl Into<String>,
        registry: Arc<ConnectionRegistry>,
        locator: Arc<dyn Locator>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            registry,
            locator,
            bus,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Send a frame to a connection.
    pub async fn write(&self, connection_id: &str, frame: Frame) -> Result<Routed> {
        self.route(connection_id, Outbound::Frame(frame)).await
    }

    /// Close a connection.
    pub async fn drop_connection(&self, connection_id: &str) -> Result<Routed> {
        self.route(connection_id, Outbound::Drop).await
    }

    async fn route(&self, connection_id: &str, message: Outbound) -> Result<Routed> {
        let message = match self.registry.deliver(connection_id, message).await {
            Delivery::Delivered => return Ok(Routed::Local),
            Delivery::Missing(message) | Delivery::Closed(message) => message,
        };

        let Some(owner) = self.locator.owner(connection_id).await? else {
            debug!(connection_id, "No lease for connection");
            return Ok(Routed::NotFound);
        };

        let event = Event::from_outbound(connection_id, message);
        self.bus.publish(&owner, &event).await?;
        counter!("gateway_events_published_total", "type" => event.kind()).increment(1);
        debug!(connection_id, owner = %owner, kind = event.kind(), "Routed event to owner");

        Ok(Routed::Remote { instance_id: owner })
    }

    /// Subscribe to this instance's bus channel.
    pub async fn subscribe(&self) -> Result<EventStream> {
        self.bus.subscribe(&self.instance_id).await
    }

    /// Dispatch bus events until the stream ends or `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut events: EventStream, shutdown: CancellationToken) {
        info!(instance_id = %self.instance_id, "Event router running");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Event router received shutdown signal");
                    break;
                }

                raw = events.next() => match raw {
                    Some(raw) => {
                        self.dispatch(&raw).await;
                    }
                    None => {
                        warn!("Event subscription ended");
                        break;
                    }
                }
            }
        }

        info!("Event router stopped");
    }

    /// Decode one raw bus event and hand it to its local connection.
    pub async fn dispatch(&self, raw: &[u8]) -> Dispatch {
        counter!("gateway_events_received_total").increment(1);

        let event = match Event::decode(raw) {
            Ok(event) => event,
            Err(GatewayError::UnknownEvent(kind)) => {
                warn!(kind = %kind, "Ignoring event of unknown type");
                counter!("gateway_events_dropped_total", "reason" => "unknown_type").increment(1);
                return Dispatch::Rejected;
            }
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable event");
                counter!("gateway_events_dropped_total", "reason" => "malformed").increment(1);
                return Dispatch::Rejected;
            }
        };

        let kind = event.kind();
        let (connection_id, message) = event.into_outbound();
        match self.registry.deliver(&connection_id, message).await {
            Delivery::Delivered => {
                debug!(connection_id = %connection_id, kind, "Delivered bus event");
                Dispatch::Delivered
            }
            Delivery::Missing(_) | Delivery::Closed(_) => {
                // The connection closed between lookup and delivery.
                warn!(connection_id = %connection_id, kind, "Bus event for unknown connection");
                counter!("gateway_events_dropped_total", "reason" => "no_connection").increment(1);
                Dispatch::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::locator::{Lease, MemoryLocator};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const TTL: Duration = Duration::from_secs(90);

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        locator: Arc<MemoryLocator>,
        bus: Arc<MemoryBus>,
        router: EventRouter,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let locator = Arc::new(MemoryLocator::new());
        let bus = Arc::new(MemoryBus::new());
        let router = EventRouter::new("gw-1", registry.clone(), locator.clone(), bus.clone());
        Fixture {
            registry,
            locator,
            bus,
            router,
        }
    }

    fn text(s: &str) -> Frame {
        Frame::Text(s.to_owned())
    }

    #[tokio::test]
    async fn test_local_connection_is_written_directly() {
        let f = fixture();
        let (tx, mut rx) = mpsc::channel(4);
        f.registry.insert("c1", tx).await.unwrap();
        let mut remote = f.bus.subscribe("gw-1").await.unwrap();

        assert_eq!(f.router.write("c1", text("hi")).await.unwrap(), Routed::Local);
        assert_eq!(rx.recv().await, Some(Outbound::Frame(text("hi"))));
        assert!(futures::FutureExt::now_or_never(remote.next()).is_none());
    }

    #[tokio::test]
    async fn test_remote_connection_is_published_to_owner() {
        let f = fixture();
        f.locator.create(&Lease::new("c1", "gw-2"), TTL).await.unwrap();
        let mut owner = f.bus.subscribe("gw-2").await.unwrap();

        assert_eq!(
            f.router.write("c1", text("hi")).await.unwrap(),
            Routed::Remote {
                instance_id: "gw-2".into()
            }
        );
        let event = Event::decode(&owner.next().await.unwrap()).unwrap();
        assert_eq!(
            event,
            Event::Write {
                connection_id: "c1".into(),
                frame: text("hi")
            }
        );

        f.router.drop_connection("c1").await.unwrap();
        let event = Event::decode(&owner.next().await.unwrap()).unwrap();
        assert_eq!(event, Event::Drop { connection_id: "c1".into() });
    }

    #[tokio::test]
    async fn test_unknown_connection_is_not_found() {
        let f = fixture();
        assert_eq!(f.router.write("ghost", text("hi")).await.unwrap(), Routed::NotFound);
        assert_eq!(f.router.drop_connection("ghost").await.unwrap(), Routed::NotFound);
    }

    struct BrokenLocator;

    #[async_trait]
    impl Locator for BrokenLocator {
        async fn create(&self, _: &Lease, _: Duration) -> Result<()> {
            Err(GatewayError::Config("locator down".into()))
        }
        async fn lease(&self, _: &str) -> Result<Option<Lease>> {
            Err(GatewayError::Config("locator down".into()))
        }
        async fn refresh(&self, _: &str, _: Duration) -> Result<bool> {
            Err(GatewayError::Config("locator down".into()))
        }
        async fn record_received(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn record_sent(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn remove(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_locator_failure_is_an_error() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = EventRouter::new(
            "gw-1",
            registry,
            Arc::new(BrokenLocator),
            Arc::new(MemoryBus::new()),
        );
        assert!(router.write("c1", text("hi")).await.is_err());
    }

    /// Registers the connection locally while the router is asking who owns
    /// it, as a join landing between the registry miss and the lease lookup.
    struct RegisterDuringLookup {
        inner: MemoryLocator,
        registry: Arc<ConnectionRegistry>,
        pending: std::sync::Mutex<Option<mpsc::Sender<Outbound>>>,
    }

    #[async_trait]
    impl Locator for RegisterDuringLookup {
        async fn create(&self, lease: &Lease, ttl: Duration) -> Result<()> {
            self.inner.create(lease, ttl).await
        }
        async fn lease(&self, connection_id: &str) -> Result<Option<Lease>> {
            self.inner.lease(connection_id).await
        }
        async fn owner(&self, connection_id: &str) -> Result<Option<String>> {
            let pending = self.pending.lock().unwrap().take();
            if let Some(tx) = pending {
                self.registry.insert(connection_id, tx).await?;
            }
            self.inner.owner(connection_id).await
        }
        async fn refresh(&self, connection_id: &str, ttl: Duration) -> Result<bool> {
            self.inner.refresh(connection_id, ttl).await
        }
        async fn record_received(&self, connection_id: &str) -> Result<()> {
            self.inner.record_received(connection_id).await
        }
        async fn record_sent(&self, connection_id: &str) -> Result<()> {
            self.inner.record_sent(connection_id).await
        }
        async fn remove(&self, connection_id: &str) -> Result<()> {
            self.inner.remove(connection_id).await
        }
    }

    #[tokio::test]
    async fn test_local_miss_with_own_lease_is_delivered_through_the_bus() {
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = Arc::new(MemoryBus::new());
        let (tx, mut rx) = mpsc::channel(4);
        let locator = RegisterDuringLookup {
            inner: MemoryLocator::new(),
            registry: registry.clone(),
            pending: std::sync::Mutex::new(Some(tx)),
        };
        locator.create(&Lease::new("c1", "gw-1"), TTL).await.unwrap();

        let router = Arc::new(EventRouter::new("gw-1", registry, Arc::new(locator), bus));
        let events = router.subscribe().await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(router.clone().run(events, shutdown.clone()));

        assert_eq!(
            router.write("c1", text("raced")).await.unwrap(),
            Routed::Remote {
                instance_id: "gw-1".into()
            }
        );
        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(delivered, Some(Outbound::Frame(text("raced"))));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_delivers_to_local_connection() {
        let f = fixture();
        let (tx, mut rx) = mpsc::channel(4);
        f.registry.insert("c1", tx).await.unwrap();

        let raw = Event::Drop { connection_id: "c1".into() }.encode().unwrap();
        assert_eq!(f.router.dispatch(&raw).await, Dispatch::Delivered);
        assert_eq!(rx.recv().await, Some(Outbound::Drop));
    }

    #[tokio::test]
    async fn test_dispatch_discards_what_it_cannot_deliver() {
        let f = fixture();
        let raw = Event::Write {
            connection_id: "gone".into(),
            frame: text("late"),
        }
        .encode()
        .unwrap();
        assert_eq!(f.router.dispatch(&raw).await, Dispatch::Unknown);
        assert_eq!(f.router.dispatch(br#"{"type":"zap","id":"c1"}"#).await, Dispatch::Rejected);
        assert_eq!(f.router.dispatch(b"{").await, Dispatch::Rejected);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let router = Arc::new(f.router);
        let (tx, mut rx) = mpsc::channel(4);
        f.registry.insert("c1", tx).await.unwrap();

        let events = router.subscribe().await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(router.clone().run(events, shutdown.clone()));

        f.bus
            .publish("gw-1", &Event::Write { connection_id: "c1".into(), frame: text("via bus") })
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::Frame(text("via bus"))));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
