//! Distributed WebSocket gateway.
//!
//! Terminates client WebSocket connections and turns them into signed HTTP
//! calls to a stateless downstream service, so downstream never holds a
//! socket:
//!
//! - a client connects: `GET` to downstream, which may refuse;
//! - the client sends a frame: `POST` to downstream;
//! - the connection closes: `DELETE` to downstream.
//!
//! Downstream talks back with `POST /` (write a frame) and `DELETE /` (close
//! the connection) against any instance of the fleet.
//!
//! ## Architecture
//!
//! ```text
//!                     downstream POST / DELETE
//!                               ↓
//!   EventRouter ── local? ── ConnectionRegistry ── session relays ── client
//!        │ miss                                        ↑
//!        ↓                                             │
//!   Locator (Redis) → owner → EventBus (NATS) → owner's EventRouter
//! ```
//!
//! Every connection holds a lease in the locator naming its instance,
//! refreshed by the heartbeat. Every instance subscribes to its own bus
//! channel.

pub mod bus;
pub mod config;
pub mod downstream;
pub mod error;
pub mod heartbeat;
pub mod locator;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod ws_server;

pub use bus::{EventBus, MemoryBus, NatsBus};
pub use config::{GatewayConfig, LifecycleConfig, LogFormat};
pub use downstream::Downstream;
pub use error::{GatewayError, Result};
pub use locator::{Lease, Locator, MemoryLocator, RedisLocator};
pub use protocol::{Event, Frame, Outbound};
pub use registry::ConnectionRegistry;
pub use router::{EventRouter, Routed};
pub use ws_server::{create_router, join_event_router, spawn_event_router, AppState};
