//! Heartbeat: ping plus lease refresh.
//!
//! Each tick pings the client and extends the connection's lease. A ping that
//! cannot be written, a refresh error or a vanished lease closes the socket
//! with 1011 and cancels the connection. Pongs are not awaited: a client
//! throttled by a slow downstream answers late, and that is not a failure.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, Message};
use bytes::Bytes;
use futures::{Sink, SinkExt};
use tokio::sync::Mutex;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::locator::Locator;
use crate::session::close_socket;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    Cancelled,
    PingFailed,
    /// The lease expired or was deleted underneath the connection.
    LeaseLost,
    RefreshFailed,
}

impl HeartbeatResult {
    fn reason(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::PingFailed => "ping failed",
            Self::LeaseLost => "lease lost",
            Self::RefreshFailed => "lease refresh failed",
        }
    }
}

pub struct Heartbeat<S> {
    pub connection_id: String,
    pub sink: Arc<Mutex<S>>,
    pub locator: Arc<dyn Locator>,
    pub interval: Duration,
    pub lease_ttl: Duration,
}

impl<S> Heartbeat<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    pub async fn run(self, cancel: CancellationToken) -> HeartbeatResult {
        let result = self.beat(&cancel).await;
        if result != HeartbeatResult::Cancelled {
            warn!(connection_id = %self.connection_id, reason = result.reason(), "Heartbeat failed");
            close_socket(&*self.sink, close_code::ERROR, result.reason()).await;
            cancel.cancel();
        }
        result
    }

    async fn beat(&self, cancel: &CancellationToken) -> HeartbeatResult {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return HeartbeatResult::Cancelled,
                _ = ticker.tick() => {}
            }

            let ping = self.sink.lock().await.send(Message::Ping(Bytes::new())).await;
            if let Err(e) = ping {
                debug!(connection_id = %self.connection_id, error = %e, "Ping write failed");
                return HeartbeatResult::PingFailed;
            }

            match self.locator.refresh(&self.connection_id, self.lease_ttl).await {
                Ok(true) => {}
                Ok(false) => return HeartbeatResult::LeaseLost,
                Err(e) => {
                    warn!(connection_id = %self.connection_id, error = %e, "Lease refresh failed");
                    return HeartbeatResult::RefreshFailed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::{Lease, MemoryLocator};
    use futures::channel::mpsc;
    use futures::StreamExt;

    const INTERVAL: Duration = Duration::from_secs(45);
    const TTL: Duration = Duration::from_secs(60);

    struct Harness {
        heartbeat: Heartbeat<mpsc::UnboundedSender<Message>>,
        frames: mpsc::UnboundedReceiver<Message>,
        locator: Arc<MemoryLocator>,
    }

    async fn harness() -> Harness {
        let (tx, frames) = mpsc::unbounded();
        let locator = Arc::new(MemoryLocator::new());
        locator.create(&Lease::new("c1", "gw-1"), Duration::from_secs(90)).await.unwrap();
        Harness {
            heartbeat: Heartbeat {
                connection_id: "c1".into(),
                sink: Arc::new(Mutex::new(tx)),
                locator: locator.clone(),
                interval: INTERVAL,
                lease_ttl: TTL,
            },
            frames,
            locator,
        }
    }

    fn close_code_of(message: Message) -> Option<u16> {
        match message {
            Message::Close(Some(frame)) => Some(frame.code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_cancelled() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(h.heartbeat.run(cancel).await, HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_keep_lease_alive() {
        let Harness {
            heartbeat,
            mut frames,
            locator,
        } = harness().await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(heartbeat.run(cancel.clone()));

        // Well past the 90s join lease: only refreshes keep it alive.
        for _ in 0..4 {
            assert!(matches!(frames.next().await, Some(Message::Ping(_))));
        }
        assert!(locator.owner("c1").await.unwrap().is_some());

        cancel.cancel();
        assert_eq!(task.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_pings_do_not_close() {
        let Harness {
            heartbeat,
            mut frames,
            ..
        } = harness().await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(heartbeat.run(cancel.clone()));

        // No pong ever comes back; only pings go out.
        for _ in 0..3 {
            assert!(matches!(frames.next().await, Some(Message::Ping(_))));
        }
        assert!(!cancel.is_cancelled());

        cancel.cancel();
        assert_eq!(task.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lease_fails() {
        let Harness {
            heartbeat,
            mut frames,
            locator,
        } = harness().await;
        locator.remove("c1").await.unwrap();
        let cancel = CancellationToken::new();

        let result = heartbeat.run(cancel.clone()).await;
        assert_eq!(result, HeartbeatResult::LeaseLost);
        assert!(matches!(frames.next().await, Some(Message::Ping(_))));
        assert_eq!(close_code_of(frames.next().await.unwrap()), Some(close_code::ERROR));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ping_write() {
        let Harness { heartbeat, frames, .. } = harness().await;
        drop(frames);
        let result = heartbeat.run(CancellationToken::new()).await;
        assert_eq!(result, HeartbeatResult::PingFailed);
    }
}
