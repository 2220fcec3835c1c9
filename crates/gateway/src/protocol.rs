//! Message types shared by the relays, the handlers and the event bus.
//!
//! A [`Frame`] is one WebSocket data message. An [`Outbound`] is what sits in a
//! connection's send channel: either a frame to write or a request to close.
//! An [`Event`] is the same instruction addressed to a connection that lives
//! on another instance, with a JSON wire form for the bus.

use axum::extract::ws::Message;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Header carrying the opaque per-connection metadata back to downstream.
pub const META_HEADER: &str = "websocket-gateway-meta";
/// Join response header that replaces the gateway-allocated connection id.
pub const OVERRIDE_ID_HEADER: &str = "websocket-gateway-override-id";
/// Header every gateway response carries with the serving instance's id.
pub const INSTANCE_ID_HEADER: &str = "instance-id";
/// Value of the `Server` header on every gateway response.
pub const SERVER_NAME: &str = "websocket-gateway";

pub const TEXT_PLAIN: &str = "text/plain";
pub const OCTET_STREAM: &str = "application/octet-stream";

// ============================================================================
// Frames
// ============================================================================

/// One WebSocket data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Build a frame from a payload and its kind. Text payloads must be UTF-8.
    pub fn from_parts(binary: bool, payload: Bytes) -> Result<Self> {
        if binary {
            return Ok(Self::Binary(payload));
        }
        String::from_utf8(payload.to_vec())
            .map(Self::Text)
            .map_err(|_| GatewayError::InvalidText)
    }

    /// Build a frame from an HTTP body. `application/octet-stream` (parameters
    /// ignored) means binary; anything else, including no content type, is text.
    pub fn from_request(content_type: Option<&str>, body: Bytes) -> Result<Self> {
        Self::from_parts(is_octet_stream(content_type), body)
    }

    /// Data frames only; control frames have no `Frame` counterpart.
    pub fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Self::Text(text.as_str().to_owned())),
            Message::Binary(data) => Some(Self::Binary(data)),
            _ => None,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Content type used when relaying this frame to downstream.
    pub fn content_type(&self) -> &'static str {
        if self.is_binary() {
            OCTET_STREAM
        } else {
            TEXT_PLAIN
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Text(text) => Bytes::from(text),
            Self::Binary(data) => data,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text.into()),
            Self::Binary(data) => Message::Binary(data),
        }
    }
}

fn is_octet_stream(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|value| value.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(OCTET_STREAM))
}

/// What a connection's outbound relay consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Write this frame to the socket.
    Frame(Frame),
    /// Close the connection normally.
    Drop,
}

// ============================================================================
// Bus events
// ============================================================================

/// An instruction for a connection owned by another instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Write { connection_id: String, frame: Frame },
    Drop { connection_id: String },
}

/// JSON shape of an [`Event`] on the bus. Payloads are base64url (no padding)
/// so binary frames survive a text transport.
#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default)]
    binary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

const WRITE: &str = "write";
const DROP: &str = "drop";

impl Event {
    /// Address an outbound instruction to a remote connection.
    pub fn from_outbound(connection_id: impl Into<String>, outbound: Outbound) -> Self {
        let connection_id = connection_id.into();
        match outbound {
            Outbound::Frame(frame) => Self::Write {
                connection_id,
                frame,
            },
            Outbound::Drop => Self::Drop { connection_id },
        }
    }

    pub fn connection_id(&self) -> &str {
        match self {
            Self::Write { connection_id, .. } | Self::Drop { connection_id } => connection_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Write { .. } => WRITE,
            Self::Drop { .. } => DROP,
        }
    }

    /// Split into the target connection and the instruction for its relay.
    pub fn into_outbound(self) -> (String, Outbound) {
        match self {
            Self::Write {
                connection_id,
                frame,
            } => (connection_id, Outbound::Frame(frame)),
            Self::Drop { connection_id } => (connection_id, Outbound::Drop),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let wire = match self {
            Self::Write {
                connection_id,
                frame,
            } => WireEvent {
                kind: WRITE.to_owned(),
                id: connection_id.clone(),
                binary: frame.is_binary(),
                payload: Some(URL_SAFE_NO_PAD.encode(frame.clone().into_bytes())),
            },
            Self::Drop { connection_id } => WireEvent {
                kind: DROP.to_owned(),
                id: connection_id.clone(),
                binary: false,
                payload: None,
            },
        };
        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let wire: WireEvent = serde_json::from_slice(raw)?;
        if wire.id.is_empty() {
            return Err(GatewayError::MalformedEvent("empty connection id".into()));
        }
        match wire.kind.as_str() {
            WRITE => {
                let payload = wire
                    .payload
                    .ok_or_else(|| GatewayError::MalformedEvent("write without payload".into()))?;
                let payload = Bytes::from(URL_SAFE_NO_PAD.decode(payload)?);
                Ok(Self::Write {
                    connection_id: wire.id,
                    frame: Frame::from_parts(wire.binary, payload)?,
                })
            }
            DROP => Ok(Self::Drop {
                connection_id: wire.id,
            }),
            other => Err(GatewayError::UnknownEvent(other.to_owned())),
        }
    }
}
