//! Life of one open connection.
//!
//! After a successful handshake the upgraded socket is driven by three
//! concurrent pieces sharing one cancellation token:
//!
//! - the inbound relay (spawned) forwards client frames to downstream in order;
//! - the heartbeat (spawned) pings the client and refreshes the lease;
//! - the outbound relay (this task) writes frames from the registry channel to
//!   the socket.
//!
//! Whichever stops first cancels the others. Once all three have returned the
//! connection is torn down exactly once: registry entry, then lease, then a
//! signed `DELETE` to downstream.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::http::HeaderValue;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::heartbeat::Heartbeat;
use crate::locator::{Lease, Locator};
use crate::protocol::{Frame, Outbound};
use crate::ws_server::AppState;

type SocketSink = SplitSink<WebSocket, Message>;

/// What a successful join hands to the upgraded connection.
#[derive(Debug, Clone)]
pub struct Admission {
    pub connection_id: String,
    /// Downstream's metadata for this connection, echoed on every later call.
    pub meta: Option<HeaderValue>,
}

/// Cancellation and single-shot teardown for one connection.
pub struct ConnectionScope {
    cancel: CancellationToken,
    torn_down: AtomicBool,
}

impl ConnectionScope {
    /// A scope cancelled with `parent` (process shutdown) or on its own.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True for exactly one caller.
    pub fn begin_teardown(&self) -> bool {
        self.torn_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Why the outbound relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The connection's scope was cancelled.
    Cancelled,
    /// A drop instruction closed the socket.
    Dropped,
    /// Writing to the socket failed.
    SendFailed,
    /// The registry entry went away.
    Unregistered,
}

/// Drive an upgraded socket from registration to teardown.
pub async fn run(socket: WebSocket, admission: Admission, state: Arc<AppState>) {
    let Admission {
        connection_id,
        meta,
    } = admission;
    let (sink, stream) = socket.split();
    let sink: Arc<Mutex<SocketSink>> = Arc::new(Mutex::new(sink));

    let (tx, rx) = mpsc::channel(state.lifecycle.channel_capacity);
    if let Err(e) = state.registry.insert(&connection_id, tx).await {
        // Another socket owns this id here; it is not ours to tear down.
        warn!(connection_id = %connection_id, error = %e, "Refusing duplicate connection");
        counter!("gateway_join_rejected_total", "reason" => "duplicate").increment(1);
        close_socket(&*sink, close_code::POLICY, "connection id in use").await;
        return;
    }

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.len().await as f64);

    let scope = ConnectionScope::new(&state.shutdown);
    let lease = Lease::new(connection_id.as_str(), state.instance_id.as_str());
    if let Err(e) = state.locator.create(&lease, state.lifecycle.join_lease_ttl).await {
        if matches!(e, GatewayError::DuplicateConnection(_)) {
            // Another instance owns this id; its lease and downstream's view stay as they are.
            warn!(connection_id = %connection_id, "Refusing connection leased by another instance");
            counter!("gateway_join_rejected_total", "reason" => "duplicate").increment(1);
            close_socket(&*sink, close_code::POLICY, "connection id in use").await;
            drop(rx);
            state.registry.remove(&connection_id).await;
            gauge!("gateway_active_connections").set(state.registry.len().await as f64);
            return;
        }
        error!(connection_id = %connection_id, error = %e, "Failed to create lease");
        close_socket(&*sink, close_code::ERROR, "lease unavailable").await;
        drop(rx);
        if scope.begin_teardown() {
            teardown(&state, &connection_id, meta.as_ref()).await;
        }
        return;
    }
    info!(connection_id = %connection_id, "Connection open");

    let inbound = tokio::spawn(inbound_relay(
        connection_id.clone(),
        meta.clone(),
        stream,
        state.clone(),
        scope.token().clone(),
    ));
    let heartbeat = tokio::spawn(
        Heartbeat {
            connection_id: connection_id.clone(),
            sink: sink.clone(),
            locator: state.locator.clone(),
            interval: state.lifecycle.heartbeat_interval,
            lease_ttl: state.lifecycle.refresh_lease_ttl,
        }
        .run(scope.token().clone()),
    );

    // The receiver is dropped when the relay returns, so any handler still
    // blocked on this channel fails fast instead of holding the registry lock.
    let exit = outbound_relay(&connection_id, rx, &*sink, state.locator.as_ref(), scope.token()).await;
    scope.cancel();

    if let Err(e) = inbound.await {
        error!(connection_id = %connection_id, error = %e, "Inbound relay panicked");
    }
    match heartbeat.await {
        Ok(result) => debug!(connection_id = %connection_id, ?result, "Heartbeat stopped"),
        Err(e) => error!(connection_id = %connection_id, error = %e, "Heartbeat panicked"),
    }

    if exit == RelayExit::Cancelled && state.shutdown.is_cancelled() {
        close_socket(&*sink, close_code::AWAY, "shutting down").await;
    } else if let Err(e) = sink.lock().await.close().await {
        debug!(connection_id = %connection_id, error = %e, "Socket close failed");
    }

    info!(connection_id = %connection_id, ?exit, "Connection closing");
    if scope.begin_teardown() {
        teardown(&state, &connection_id, meta.as_ref()).await;
    }
}

/// Forward client frames to downstream until the client goes away, a
/// transport error occurs or the scope is cancelled.
async fn inbound_relay(
    connection_id: String,
    meta: Option<HeaderValue>,
    mut stream: SplitStream<WebSocket>,
    state: Arc<AppState>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(connection_id = %connection_id, error = %e, "Socket read failed");
                break;
            }
            None => {
                debug!(connection_id = %connection_id, "Socket ended");
                break;
            }
        };

        let frame = match message {
            Message::Close(frame) => {
                debug!(connection_id = %connection_id, code = ?frame.map(|f| f.code), "Client closed");
                break;
            }
            other => match Frame::from_message(other) {
                Some(frame) => frame,
                None => continue,
            },
        };

        if let Err(e) = state.locator.record_received(&connection_id).await {
            warn!(connection_id = %connection_id, error = %e, "Failed to count inbound frame");
        }

        let forwarded = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = state.downstream.forward(&connection_id, meta.as_ref(), frame) => result,
        };
        match forwarded {
            Ok(status) if status.is_success() => {
                counter!("gateway_frames_forwarded_total").increment(1);
            }
            Ok(status) => {
                warn!(connection_id = %connection_id, %status, "Downstream rejected frame");
            }
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Failed to relay frame to downstream");
                break;
            }
        }
    }

    cancel.cancel();
}

/// Write instructions from the registry channel to the socket.
pub(crate) async fn outbound_relay<S>(
    connection_id: &str,
    mut rx: mpsc::Receiver<Outbound>,
    sink: &Mutex<S>,
    locator: &dyn Locator,
    cancel: &CancellationToken,
) -> RelayExit
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RelayExit::Cancelled,
            next = rx.recv() => next,
        };

        match next {
            Some(Outbound::Frame(frame)) => {
                let sent = sink.lock().await.send(frame.into_message()).await;
                if let Err(e) = sent {
                    debug!(connection_id, error = %e, "Socket write failed");
                    return RelayExit::SendFailed;
                }
                counter!("gateway_frames_delivered_total").increment(1);
                if let Err(e) = locator.record_sent(connection_id).await {
                    warn!(connection_id, error = %e, "Failed to count outbound frame");
                }
            }
            Some(Outbound::Drop) => {
                debug!(connection_id, "Dropping connection");
                close_socket(sink, close_code::NORMAL, "").await;
                return RelayExit::Dropped;
            }
            None => return RelayExit::Unregistered,
        }
    }
}

/// Send a close frame. Failures only mean the socket is already gone.
pub(crate) async fn close_socket<S>(sink: &Mutex<S>, code: u16, reason: &'static str)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = sink.lock().await.send(Message::Close(Some(frame))).await {
        debug!(code, error = %e, "Close frame not sent");
    }
}

/// Registry entry, then lease, then downstream notification. Later steps run
/// even if earlier ones fail.
async fn teardown(state: &AppState, connection_id: &str, meta: Option<&HeaderValue>) {
    state.registry.remove(connection_id).await;

    if let Err(e) = state.locator.remove(connection_id).await {
        error!(connection_id, error = %e, "Failed to remove lease");
        counter!("gateway_teardown_errors_total", "step" => "lease").increment(1);
    }

    match state.downstream.leave(connection_id, meta).await {
        Ok(status) if status.is_success() => {}
        Ok(status) => warn!(connection_id, %status, "Downstream rejected disconnect"),
        Err(e) => {
            warn!(connection_id, error = %e, "Failed to notify downstream of disconnect");
            counter!("gateway_teardown_errors_total", "step" => "downstream").increment(1);
        }
    }

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.len().await as f64);
    info!(connection_id, "Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::MemoryLocator;
    use std::time::Duration;

    fn unbounded_sink() -> (
        Mutex<futures::channel::mpsc::UnboundedSender<Message>>,
        futures::channel::mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        (Mutex::new(tx), rx)
    }

    async fn leased(id: &str) -> MemoryLocator {
        let locator = MemoryLocator::new();
        locator
            .create(&Lease::new(id, "gw-1"), Duration::from_secs(90))
            .await
            .unwrap();
        locator
    }

    #[test]
    fn test_teardown_runs_once_under_contention() {
        let scope = Arc::new(ConnectionScope::new(&CancellationToken::new()));
        let winners: usize = (0..8)
            .map(|_| {
                let scope = scope.clone();
                std::thread::spawn(move || scope.begin_teardown())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| usize::from(handle.join().unwrap()))
            .sum();
        assert_eq!(winners, 1);
        assert!(!scope.begin_teardown());
    }

    #[test]
    fn test_scope_follows_process_shutdown() {
        let process = CancellationToken::new();
        let scope = ConnectionScope::new(&process);
        let sibling = ConnectionScope::new(&process);

        scope.cancel();
        assert!(scope.token().is_cancelled());
        assert!(!process.is_cancelled());
        assert!(!sibling.token().is_cancelled());

        process.cancel();
        assert!(sibling.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_outbound_writes_frames_in_order_and_counts_them() {
        let locator = leased("c1").await;
        let (sink, mut written) = unbounded_sink();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Outbound::Frame(Frame::Text("one".into()))).await.unwrap();
        tx.send(Outbound::Frame(Frame::Binary(bytes::Bytes::from_static(b"two")))).await.unwrap();
        drop(tx);

        let exit = outbound_relay("c1", rx, &sink, &locator, &CancellationToken::new()).await;
        assert_eq!(exit, RelayExit::Unregistered);

        assert_eq!(written.next().await, Some(Message::Text("one".into())));
        assert_eq!(
            written.next().await,
            Some(Message::Binary(bytes::Bytes::from_static(b"two")))
        );
        assert_eq!(locator.lease("c1").await.unwrap().unwrap().sent, 2);
    }

    #[tokio::test]
    async fn test_outbound_drop_closes_normally() {
        let locator = leased("c1").await;
        let (sink, mut written) = unbounded_sink();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Outbound::Drop).await.unwrap();
        tx.send(Outbound::Frame(Frame::Text("after".into()))).await.unwrap();

        let exit = outbound_relay("c1", rx, &sink, &locator, &CancellationToken::new()).await;
        assert_eq!(exit, RelayExit::Dropped);

        match written.next().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::NORMAL),
            other => panic!("expected close frame, got {other:?}"),
        }
        // Nothing written after the close; the relay is gone and so is the receiver.
        drop(sink);
        assert_eq!(written.next().await, None);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_outbound_stops_on_cancel() {
        let locator = MemoryLocator::new();
        let (sink, _written) = unbounded_sink();
        let (_tx, rx) = mpsc::channel::<Outbound>(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let exit = outbound_relay("c1", rx, &sink, &locator, &cancel).await;
        assert_eq!(exit, RelayExit::Cancelled);
    }

    #[tokio::test]
    async fn test_outbound_write_failure_ends_connection() {
        let locator = MemoryLocator::new();
        let (sink, written) = unbounded_sink();
        drop(written);
        let (tx, rx) = mpsc::channel(8);
        tx.send(Outbound::Frame(Frame::Text("lost".into()))).await.unwrap();

        let exit = outbound_relay("c1", rx, &sink, &locator, &CancellationToken::new()).await;
        assert_eq!(exit, RelayExit::SendFailed);
    }
}
