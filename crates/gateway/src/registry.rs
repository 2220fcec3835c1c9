//! Registry of the connections open on this instance.
//!
//! Maps a connection id to the sending half of that connection's outbound
//! channel. The registry holds the only sender, so removing an entry is what
//! closes the channel.
//!
//! One read/write lock guards the map. Delivery holds the read lock for the
//! whole lookup-and-send, which keeps it from racing a removal: once `remove`
//! has returned, no delivery can reach the old channel. Deliveries to
//! different connections share the read lock and run concurrently.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::protocol::Outbound;

/// Outcome of a local delivery attempt. Undelivered messages are handed back.
#[derive(Debug)]
pub enum Delivery {
    Delivered,
    /// No connection with that id is registered here.
    Missing(Outbound),
    /// Registered, but its relay has already stopped reading.
    Closed(Outbound),
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, mpsc::Sender<Outbound>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Fails, leaving the existing entry alone, if the
    /// id is already taken on this instance.
    pub async fn insert(&self, connection_id: &str, tx: mpsc::Sender<Outbound>) -> Result<()> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(connection_id) {
            return Err(GatewayError::DuplicateConnection(connection_id.to_owned()));
        }
        connections.insert(connection_id.to_owned(), tx);
        info!(connection_id, "Connection registered");
        Ok(())
    }

    /// Hand a message to a local connection, waiting for channel capacity.
    pub async fn deliver(&self, connection_id: &str, message: Outbound) -> Delivery {
        let connections = self.connections.read().await;
        let Some(tx) = connections.get(connection_id) else {
            return Delivery::Missing(message);
        };
        match tx.send(message).await {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::SendError(message)) => {
                debug!(connection_id, "Outbound channel closed");
                Delivery::Closed(message)
            }
        }
    }

    /// Unregister a connection, closing its outbound channel. Returns whether
    /// an entry was removed; removing twice is harmless.
    pub async fn remove(&self, connection_id: &str) -> bool {
        let removed = self.connections.write().await.remove(connection_id).is_some();
        if removed {
            info!(connection_id, "Connection unregistered");
        }
        removed
    }

    pub async fn contains(&self, connection_id: &str) -> bool {
        self.connections.read().await.contains_key(connection_id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
