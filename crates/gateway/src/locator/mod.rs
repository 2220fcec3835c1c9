//! Distributed connection locator.
//!
//! Every open connection has a lease naming the instance that owns it. Any
//! instance can look up the owner of a connection it does not hold, and the
//! lease expires on its own if the owner dies without cleaning up.

mod memory;
mod redis_locator;

pub use self::memory::MemoryLocator;
pub use self::redis_locator::RedisLocator;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::Result;

/// Key prefix for leases: ws:{connection_id}
pub const LEASE_KEY_PREFIX: &str = "ws:";

pub fn lease_key(connection_id: &str) -> String {
    format!("{LEASE_KEY_PREFIX}{connection_id}")
}

/// The record behind a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub connection_id: String,
    /// Owning instance.
    pub instance_id: String,
    /// Unix seconds.
    pub joined_at: i64,
    /// Frames received from the client.
    pub received: u64,
    /// Frames sent to the client.
    pub sent: u64,
}

impl Lease {
    pub fn new(connection_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            instance_id: instance_id.into(),
            joined_at: Utc::now().timestamp(),
            received: 0,
            sent: 0,
        }
    }
}

#[async_trait]
pub trait Locator: Send + Sync + 'static {
    /// Write a fresh lease. A stale record of the same instance is replaced;
    /// a live lease of another instance fails with
    /// [`GatewayError::DuplicateConnection`](crate::error::GatewayError::DuplicateConnection).
    async fn create(&self, lease: &Lease, ttl: Duration) -> Result<()>;

    /// Read a live lease.
    async fn lease(&self, connection_id: &str) -> Result<Option<Lease>>;

    /// Owning instance of a live lease.
    async fn owner(&self, connection_id: &str) -> Result<Option<String>> {
        Ok(self.lease(connection_id).await?.map(|lease| lease.instance_id))
    }

    /// Extend a lease. `false` means the lease no longer exists.
    async fn refresh(&self, connection_id: &str, ttl: Duration) -> Result<bool>;

    /// Count one frame from the client. A missing lease is left missing.
    async fn record_received(&self, connection_id: &str) -> Result<()>;

    /// Count one frame to the client. A missing lease is left missing.
    async fn record_sent(&self, connection_id: &str) -> Result<()>;

    async fn remove(&self, connection_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_key() {
        assert_eq!(lease_key("0190c0de"), "ws:0190c0de");
    }

    #[test]
    fn test_new_lease_starts_at_zero() {
        let lease = Lease::new("c1", "gw-1");
        assert_eq!(lease.instance_id, "gw-1");
        assert_eq!((lease.received, lease.sent), (0, 0));
        assert!(lease.joined_at > 0);
    }
}
