//! HTTP surface of the gateway using Axum.
//!
//! | Route                        | Caller     | Purpose                          |
//! |------------------------------|------------|----------------------------------|
//! | `GET /` (upgrade)            | clients    | open a connection                |
//! | `POST /`                     | downstream | write a frame to a connection    |
//! | `DELETE /`                   | downstream | close a connection               |
//! | `GET /.well-known/public.txt`| downstream | this gateway's verifying key     |
//! | `GET /health`                | operators  | liveness                         |

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{FromRequestParts, RawQuery, State, WebSocketUpgrade};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use common::{new_id, Verifier, PUBLIC_KEY_PATH};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::config::LifecycleConfig;
use crate::downstream::Downstream;
use crate::error::Result;
use crate::locator::Locator;
use crate::protocol::{Frame, INSTANCE_ID_HEADER, SERVER_NAME};
use crate::registry::ConnectionRegistry;
use crate::router::{EventRouter, Routed};
use crate::session::{self, Admission};

/// Shared application state.
pub struct AppState {
    pub instance_id: String,
    pub registry: Arc<ConnectionRegistry>,
    pub locator: Arc<dyn Locator>,
    pub router: Arc<EventRouter>,
    pub downstream: Downstream,
    /// Checks tokens downstream puts on `POST` and `DELETE`.
    pub verifier: Verifier,
    /// This gateway's verifying key, base64url.
    pub public_key: String,
    pub lifecycle: LifecycleConfig,
    /// Extra host accepted in a browser `Origin` header.
    pub service_domain: Option<String>,
    /// Process-wide shutdown; every connection's scope is a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        instance_id: impl Into<String>,
        locator: Arc<dyn Locator>,
        bus: Arc<dyn EventBus>,
        downstream: Downstream,
        verifier: Verifier,
        lifecycle: LifecycleConfig,
    ) -> Self {
        let instance_id = instance_id.into();
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(EventRouter::new(
            instance_id.clone(),
            registry.clone(),
            locator.clone(),
            bus,
        ));
        let public_key = downstream.signer().encoded_public_key();

        Self {
            instance_id,
            registry,
            locator,
            router,
            downstream,
            verifier,
            public_key,
            lifecycle,
            service_domain: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_service_domain(mut self, service_domain: Option<String>) -> Self {
        self.service_domain = service_domain;
        self
    }

    /// Wait for every open connection to finish teardown, up to `timeout`.
    /// Returns whether the registry drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            while !self.registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        drained.is_ok()
    }
}

/// Subscribe to this instance's bus channel and dispatch it in the background.
///
/// Subscribing happens before this returns, so events published afterwards
/// are not missed. Fails if the subscription cannot be made.
pub async fn spawn_event_router(state: &Arc<AppState>) -> Result<JoinHandle<()>> {
    let events = state.router.subscribe().await?;
    let router = state.router.clone();
    let shutdown = state.shutdown.clone();
    Ok(tokio::spawn(router.run(events, shutdown)))
}

/// Wait for the event router task to finish. Returns false if it panicked.
pub async fn join_event_router(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "Event router panicked");
            false
        }
    }
}

/// Create the gateway router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let instance_id = HeaderValue::from_str(&state.instance_id)
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));

    Router::new()
        .route(
            "/",
            get(join_handler).post(write_handler).delete(drop_handler),
        )
        .route(PUBLIC_KEY_PATH, get(public_key_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static(SERVER_NAME),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static(INSTANCE_ID_HEADER),
            instance_id,
        ))
        .layer(TraceLayer::new_for_http())
}

/// Health check handler.
async fn health_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn public_key_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], state.public_key.clone())
}

/// Connection id proven by a valid downstream token.
pub struct Authenticated(pub String);

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> std::result::Result<Self, Self::Rejection> {
        match state.verifier.verify_request(&parts.headers) {
            Some(connection_id) => Ok(Self(connection_id)),
            None => {
                counter!("gateway_auth_failures_total").increment(1);
                debug!(method = %parts.method, "Rejected unauthenticated request");
                Err(StatusCode::UNAUTHORIZED)
            }
        }
    }
}

/// Join: handshake with downstream, then upgrade.
async fn join_handler(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(reason = %rejection, "Not a WebSocket upgrade");
            return StatusCode::UPGRADE_REQUIRED.into_response();
        }
    };

    if !origin_allowed(&headers, state.service_domain.as_deref()) {
        counter!("gateway_join_rejected_total", "reason" => "origin").increment(1);
        return StatusCode::FORBIDDEN.into_response();
    }

    let connection_id = new_id();
    let handshake = match state
        .downstream
        .join(&connection_id, &headers, query.as_deref())
        .await
    {
        Ok(handshake) => handshake,
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "Join handshake with downstream failed");
            counter!("gateway_join_rejected_total", "reason" => "downstream_error").increment(1);
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    if !handshake.accepted() {
        counter!("gateway_join_rejected_total", "reason" => "refused").increment(1);
        return handshake.status.into_response();
    }

    let admission = Admission {
        connection_id: handshake.override_id.unwrap_or(connection_id),
        meta: handshake.meta,
    };
    info!(connection_id = %admission.connection_id, "Join accepted");

    ws.on_failed_upgrade(|e| warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| session::run(socket, admission, state))
}

/// Write: deliver the body as one frame to the named connection.
async fn write_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(connection_id): Authenticated,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let frame = match Frame::from_request(content_type, body) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(connection_id = %connection_id, error = %e, "Rejected write");
            return StatusCode::BAD_REQUEST;
        }
    };

    routed_status(&connection_id, state.router.write(&connection_id, frame).await)
}

/// Drop: close the named connection.
async fn drop_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(connection_id): Authenticated,
) -> StatusCode {
    routed_status(&connection_id, state.router.drop_connection(&connection_id).await)
}

fn routed_status(connection_id: &str, routed: Result<Routed>) -> StatusCode {
    match routed {
        Ok(Routed::Local) => StatusCode::OK,
        Ok(Routed::Remote { .. }) => StatusCode::CREATED,
        Ok(Routed::NotFound) => StatusCode::NOT_FOUND,
        Err(e) => {
            error!(connection_id, error = %e, "Failed to route event");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Requests without `Origin` (non-browser clients) pass. Otherwise the origin
/// host must be the request's own `Host` or the configured service domain.
fn origin_allowed(headers: &HeaderMap, service_domain: Option<&str>) -> bool {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    let Some(authority) = origin
        .to_str()
        .ok()
        .and_then(|origin| origin.parse::<Uri>().ok())
        .and_then(|uri| uri.authority().cloned())
    else {
        return false;
    };

    let same_host = headers
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .is_some_and(|host| host.eq_ignore_ascii_case(authority.as_str()));
    let service_host =
        service_domain.is_some_and(|domain| domain.eq_ignore_ascii_case(authority.host()));

    same_host || service_host
}
