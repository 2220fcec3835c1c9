//! In-process locator for single-instance deployments and tests.
//!
//! Instances sharing one `MemoryLocator` (behind an `Arc`) see each other's
//! leases, which is enough to run a multi-instance fleet inside one process.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{Lease, Locator};
use crate::error::{GatewayError, Result};

struct Record {
    lease: Lease,
    expires_at: Instant,
}

impl Record {
    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Default)]
pub struct MemoryLocator {
    leases: DashMap<String, Record>,
}

impl MemoryLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live leases.
    pub fn len(&self) -> usize {
        self.leases.iter().filter(|entry| entry.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bump(&self, connection_id: &str, update: impl FnOnce(&mut Lease)) {
        if let Some(mut entry) = self.leases.get_mut(connection_id) {
            if entry.is_live() {
                update(&mut entry.lease);
            }
        }
    }
}

#[async_trait]
impl Locator for MemoryLocator {
    async fn create(&self, lease: &Lease, ttl: Duration) -> Result<()> {
        let record = Record {
            lease: lease.clone(),
            expires_at: Instant::now() + ttl,
        };
        match self.leases.entry(lease.connection_id.clone()) {
            Entry::Occupied(mut slot) => {
                let held = slot.get();
                if held.is_live() && held.lease.instance_id != lease.instance_id {
                    return Err(GatewayError::DuplicateConnection(lease.connection_id.clone()));
                }
                slot.insert(record);
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
        Ok(())
    }

    async fn lease(&self, connection_id: &str) -> Result<Option<Lease>> {
        let expired = match self.leases.get(connection_id) {
            Some(entry) if entry.is_live() => return Ok(Some(entry.lease.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.leases.remove_if(connection_id, |_, entry| !entry.is_live());
        }
        Ok(None)
    }

    async fn refresh(&self, connection_id: &str, ttl: Duration) -> Result<bool> {
        match self.leases.get_mut(connection_id) {
            Some(mut entry) if entry.is_live() => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_received(&self, connection_id: &str) -> Result<()> {
        self.bump(connection_id, |lease| lease.received += 1);
        Ok(())
    }

    async fn record_sent(&self, connection_id: &str) -> Result<()> {
        self.bump(connection_id, |lease| lease.sent += 1);
        Ok(())
    }

    async fn remove(&self, connection_id: &str) -> Result<()> {
        self.leases.remove(connection_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(90);

    #[tokio::test]
    async fn test_create_and_lookup() {
        let locator = MemoryLocator::new();
        locator.create(&Lease::new("c1", "gw-1"), TTL).await.unwrap();

        assert_eq!(locator.owner("c1").await.unwrap().as_deref(), Some("gw-1"));
        assert_eq!(locator.owner("c2").await.unwrap(), None);
        assert_eq!(locator.len(), 1);
    }

    #[tokio::test]
    async fn test_counters() {
        let locator = MemoryLocator::new();
        locator.create(&Lease::new("c1", "gw-1"), TTL).await.unwrap();

        locator.record_received("c1").await.unwrap();
        locator.record_received("c1").await.unwrap();
        locator.record_sent("c1").await.unwrap();

        let lease = locator.lease("c1").await.unwrap().unwrap();
        assert_eq!((lease.received, lease.sent), (2, 1));
    }

    #[tokio::test]
    async fn test_counters_do_not_resurrect_removed_lease() {
        let locator = MemoryLocator::new();
        locator.create(&Lease::new("c1", "gw-1"), TTL).await.unwrap();
        locator.remove("c1").await.unwrap();

        locator.record_received("c1").await.unwrap();
        locator.record_sent("c1").await.unwrap();
        assert!(locator.lease("c1").await.unwrap().is_none());
        assert!(locator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires() {
        let locator = MemoryLocator::new();
        locator.create(&Lease::new("c1", "gw-1"), TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(locator.owner("c1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(locator.owner("c1").await.unwrap().is_none());
        assert!(!locator.refresh("c1", TTL).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_lease() {
        let locator = MemoryLocator::new();
        locator.create(&Lease::new("c1", "gw-1"), TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(80)).await;
        assert!(locator.refresh("c1", Duration::from_secs(60)).await.unwrap());

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(locator.owner("c1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(locator.owner("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_replaces_own_stale_record() {
        let locator = MemoryLocator::new();
        locator.create(&Lease::new("c1", "gw-1"), TTL).await.unwrap();
        locator.record_sent("c1").await.unwrap();

        locator.create(&Lease::new("c1", "gw-1"), TTL).await.unwrap();
        let lease = locator.lease("c1").await.unwrap().unwrap();
        assert_eq!(lease.instance_id, "gw-1");
        assert_eq!(lease.sent, 0);
    }

    #[tokio::test]
    async fn test_create_refuses_lease_held_by_another_instance() {
        let locator = MemoryLocator::new();
        locator.create(&Lease::new("c1", "gw-1"), TTL).await.unwrap();

        let err = locator.create(&Lease::new("c1", "gw-2"), TTL).await.unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateConnection(id) if id == "c1"));
        assert_eq!(locator.owner("c1").await.unwrap().as_deref(), Some("gw-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_takes_over_expired_lease() {
        let locator = MemoryLocator::new();
        locator.create(&Lease::new("c1", "gw-1"), TTL).await.unwrap();
        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        locator.create(&Lease::new("c1", "gw-2"), TTL).await.unwrap();
        assert_eq!(locator.owner("c1").await.unwrap().as_deref(), Some("gw-2"));
    }
}
