//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Distributed locator (Redis) error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Event bus error (surfaced through nats_client).
    #[error("Event bus error: {0}")]
    Bus(#[from] anyhow::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Downstream HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Token signing or key decoding error.
    #[error("Signing error: {0}")]
    Signing(#[from] common::SigningError),

    /// Transport encoding error on an event payload.
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A value could not be carried in an HTTP header.
    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] axum::http::header::InvalidHeaderValue),

    /// Text frame payload was not UTF-8.
    #[error("Text payload is not valid UTF-8")]
    InvalidText,

    /// Bus event carried a type tag this instance does not understand.
    #[error("Unknown event type: {0}")]
    UnknownEvent(String),

    /// Bus event was structurally incomplete.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Connection id already registered on this instance.
    #[error("Connection already registered: {0}")]
    DuplicateConnection(String),

    /// Downstream answered a non-success status where one was required.
    #[error("Downstream returned {0}")]
    DownstreamStatus(reqwest::StatusCode),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
