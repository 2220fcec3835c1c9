//! Gateway configuration.
//!
//! Everything comes from environment variables (optionally seeded from a
//! `.env` file in `main`). Protocol timings sit in [`LifecycleConfig`] so tests
//! can shrink them without touching the environment.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_METRICS_PORT: u16 = 9093;
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
const DEFAULT_NATS_URL: &str = "nats://localhost:4222";

/// Timings and capacities of a connection's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Per-call timeout for every downstream request.
    pub downstream_timeout: Duration,
    /// Lease lifetime set when a connection opens.
    pub join_lease_ttl: Duration,
    /// Interval between pings (and lease refreshes).
    pub heartbeat_interval: Duration,
    /// Lease lifetime set by each heartbeat refresh.
    pub refresh_lease_ttl: Duration,
    /// Accepted clock skew, either direction, on inbound tokens.
    pub replay_window: Duration,
    /// Capacity of each connection's outbound channel.
    pub channel_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            downstream_timeout: Duration::from_secs(30),
            join_lease_ttl: Duration::from_secs(90),
            heartbeat_interval: Duration::from_secs(45),
            refresh_lease_ttl: Duration::from_secs(60),
            replay_window: common::DEFAULT_REPLAY_WINDOW,
            channel_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = GatewayError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(GatewayError::Config(format!("unknown LOG_FORMAT {other:?}"))),
        }
    }
}

/// Process configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    /// Fleet-unique id; also names this instance's bus channel.
    pub instance_id: String,
    pub downstream_url: String,
    pub redis_url: String,
    pub nats_url: String,
    /// Base64 Ed25519 signing key.
    #[serde(skip_serializing)]
    pub private_key: String,
    /// Extra host accepted in a browser `Origin` header.
    pub service_domain: Option<String>,
    pub log_format: LogFormat,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("http_port", &self.http_port)
            .field("metrics_port", &self.metrics_port)
            .field("instance_id", &self.instance_id)
            .field("downstream_url", &self.downstream_url)
            .field("redis_url", &self.redis_url)
            .field("nats_url", &self.nats_url)
            .field("private_key", &"<redacted>")
            .field("service_domain", &self.service_domain)
            .field("log_format", &self.log_format)
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let http_port = match var("HTTP_PORT").or_else(|| var("PORT")) {
            Some(value) => parse_port("HTTP_PORT", &value)?,
            None => DEFAULT_HTTP_PORT,
        };
        let metrics_port = match var("METRICS_PORT") {
            Some(value) => parse_port("METRICS_PORT", &value)?,
            None => DEFAULT_METRICS_PORT,
        };

        let instance_id = var("INSTANCE_ID").unwrap_or_else(common::new_id);
        if axum::http::HeaderValue::from_str(&instance_id).is_err() {
            return Err(GatewayError::Config(
                "INSTANCE_ID must be a valid header value".into(),
            ));
        }

        let downstream_url = var("DOWNSTREAM_URL")
            .ok_or_else(|| GatewayError::Config("DOWNSTREAM_URL is required".into()))?;
        let private_key = var("PRIVATE_KEY")
            .ok_or_else(|| GatewayError::Config("PRIVATE_KEY is required".into()))?;

        let log_format = match var("LOG_FORMAT") {
            Some(value) => value.parse()?,
            None => LogFormat::default(),
        };

        Ok(Self {
            http_port,
            metrics_port,
            instance_id,
            downstream_url: downstream_url.trim_end_matches('/').to_owned(),
            redis_url: var("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_owned()),
            nats_url: var("NATS_URL").unwrap_or_else(|| DEFAULT_NATS_URL.to_owned()),
            private_key,
            service_domain: var("SERVICE_DOMAIN"),
            log_format,
            lifecycle: LifecycleConfig::default(),
        })
    }
}

fn parse_port(name: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|_| GatewayError::Config(format!("{name} must be a port number, got {value:?}")))
}
