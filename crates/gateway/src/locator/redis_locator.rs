//! Redis-backed locator.
//!
//! Each lease is a hash at `ws:{connection_id}`:
//!
//! | field  | value                     |
//! |--------|---------------------------|
//! | `inst` | owning instance id        |
//! | `join` | join time, unix seconds   |
//! | `recv` | frames from the client    |
//! | `sent` | frames to the client      |
//!
//! Expiry is the key's TTL. Creating a lease never takes over one held by
//! another instance; the claim and the counters run as Lua scripts so each is
//! a single atomic step.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use super::{lease_key, Lease, Locator};
use crate::error::{GatewayError, Result};

const FIELD_INSTANCE: &str = "inst";
const FIELD_JOINED: &str = "join";
const FIELD_RECEIVED: &str = "recv";
const FIELD_SENT: &str = "sent";

/// Claim the key unless another instance holds it. Returns 1 when claimed.
const CLAIM: &str = r"
local owner = redis.call('HGET', KEYS[1], 'inst')
if owner and owner ~= ARGV[1] then
    return 0
end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'inst', ARGV[1], 'join', ARGV[2], 'recv', ARGV[3], 'sent', ARGV[4])
redis.call('EXPIRE', KEYS[1], ARGV[5])
return 1
";

/// HINCRBY that never creates the key.
const INCREMENT_IF_PRESENT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
end
return false
";

#[derive(Clone)]
pub struct RedisLocator {
    conn: MultiplexedConnection,
    claim: Script,
    increment: Script,
}

impl RedisLocator {
    /// Connect and ping. Fails if the server is unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Connected to Redis");

        Ok(Self {
            conn,
            claim: Script::new(CLAIM),
            increment: Script::new(INCREMENT_IF_PRESENT),
        })
    }

    async fn increment(&self, connection_id: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let count: Option<i64> = self
            .increment
            .key(lease_key(connection_id))
            .arg(field)
            .invoke_async(&mut conn)
            .await?;
        if count.is_none() {
            debug!(connection_id, field, "Counter skipped, lease missing");
        }
        Ok(())
    }
}

/// EXPIRE takes whole seconds and deletes the key at zero.
fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX)
}

fn parse_lease(connection_id: &str, mut fields: HashMap<String, String>) -> Option<Lease> {
    let instance_id = fields.remove(FIELD_INSTANCE)?;
    let number = |field: &str| fields.get(field).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);

    Some(Lease {
        connection_id: connection_id.to_owned(),
        instance_id,
        joined_at: fields
            .get(FIELD_JOINED)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        received: number(FIELD_RECEIVED),
        sent: number(FIELD_SENT),
    })
}

#[async_trait]
impl Locator for RedisLocator {
    async fn create(&self, lease: &Lease, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let claimed: i64 = self
            .claim
            .key(lease_key(&lease.connection_id))
            .arg(&lease.instance_id)
            .arg(lease.joined_at)
            .arg(lease.received)
            .arg(lease.sent)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        if claimed == 0 {
            return Err(GatewayError::DuplicateConnection(lease.connection_id.clone()));
        }

        debug!(connection_id = %lease.connection_id, instance_id = %lease.instance_id, "Lease created");
        Ok(())
    }

    async fn lease(&self, connection_id: &str) -> Result<Option<Lease>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(lease_key(connection_id)).await?;
        Ok(parse_lease(connection_id, fields))
    }

    async fn owner(&self, connection_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = conn.hget(lease_key(connection_id), FIELD_INSTANCE).await?;
        Ok(owner)
    }

    async fn refresh(&self, connection_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let refreshed: bool = conn.expire(lease_key(connection_id), ttl_secs(ttl)).await?;
        Ok(refreshed)
    }

    async fn record_received(&self, connection_id: &str) -> Result<()> {
        self.increment(connection_id, FIELD_RECEIVED).await
    }

    async fn record_sent(&self, connection_id: &str) -> Result<()> {
        self.increment(connection_id, FIELD_SENT).await
    }

    async fn remove(&self, connection_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(lease_key(connection_id)).await?;
        debug!(connection_id, "Lease removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_parse_lease() {
        let lease = parse_lease(
            "c1",
            hash(&[("inst", "gw-1"), ("join", "1700000000"), ("recv", "3"), ("sent", "7")]),
        )
        .unwrap();
        assert_eq!(
            lease,
            Lease {
                connection_id: "c1".into(),
                instance_id: "gw-1".into(),
                joined_at: 1_700_000_000,
                received: 3,
                sent: 7,
            }
        );
    }

    #[test]
    fn test_parse_lease_without_owner_is_absent() {
        // HGETALL on a missing key returns an empty hash.
        assert!(parse_lease("c1", HashMap::new()).is_none());
        assert!(parse_lease("c1", hash(&[("recv", "1")])).is_none());
    }

    #[test]
    fn test_parse_lease_tolerates_missing_counters() {
        let lease = parse_lease("c1", hash(&[("inst", "gw-1")])).unwrap();
        assert_eq!((lease.joined_at, lease.received, lease.sent), (0, 0, 0));
    }

    #[test]
    fn test_ttl_rounds_to_whole_seconds() {
        assert_eq!(ttl_secs(Duration::from_secs(90)), 90);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 1);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }
}
