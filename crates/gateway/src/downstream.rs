//! Signed HTTP calls to the downstream service.
//!
//! Downstream sees each connection as three kinds of request against its base
//! URL: `GET` when it opens, `POST` per client frame, `DELETE` when it closes.
//! Every call carries a token signed for the connection id.

use std::time::Duration;

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use bytes::Bytes;
use common::{decode_public_key, Signer, AUTH_HEADER, PUBLIC_KEY_PATH};
use ed25519_dalek::VerifyingKey;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::protocol::{Frame, META_HEADER, OVERRIDE_ID_HEADER};

/// Client request headers that describe the client's hop or its WebSocket
/// handshake, not the client. Never forwarded on join.
const UNFORWARDED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "content-length",
    "accept-encoding",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
    "sec-websocket-accept",
    AUTH_HEADER,
];

fn is_forwarded(name: &HeaderName) -> bool {
    !UNFORWARDED_HEADERS.contains(&name.as_str())
}

/// Downstream's answer to a join.
#[derive(Debug)]
pub struct Handshake {
    pub status: StatusCode,
    /// Opaque metadata echoed on every later call for the connection.
    pub meta: Option<HeaderValue>,
    /// Connection id chosen by downstream instead of the gateway's.
    pub override_id: Option<String>,
}

impl Handshake {
    pub fn accepted(&self) -> bool {
        self.status == StatusCode::OK || self.status == StatusCode::NO_CONTENT
    }
}

pub struct Downstream {
    client: reqwest::Client,
    base_url: String,
    signer: Signer,
}

impl Downstream {
    pub fn new(base_url: &str, signer: Signer, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            signer,
        })
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch downstream's public key from its well-known path.
    pub async fn fetch_public_key(&self) -> Result<VerifyingKey> {
        let url = format!("{}{}", self.base_url, PUBLIC_KEY_PATH);
        info!("Fetching downstream public key from {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::DownstreamStatus(response.status()));
        }
        let body = response.text().await?;
        Ok(decode_public_key(&body)?)
    }

    /// Ask downstream whether a client may open a connection.
    ///
    /// Forwards the client's query string and request headers (minus hop and
    /// handshake headers). The response body becomes the connection's meta.
    pub async fn join(
        &self,
        connection_id: &str,
        client_headers: &HeaderMap,
        query: Option<&str>,
    ) -> Result<Handshake> {
        let mut headers = HeaderMap::with_capacity(client_headers.len() + 1);
        for (name, value) in client_headers {
            if is_forwarded(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        self.signer.sign_request(&mut headers, connection_id)?;

        let url = match query {
            Some(query) if !query.is_empty() => format!("{}?{}", self.base_url, query),
            _ => self.base_url.clone(),
        };
        let response = self.client.get(url).headers(headers).send().await?;

        let status = response.status();
        let override_id = response
            .headers()
            .get(OVERRIDE_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_owned);
        let body = response.bytes().await?;

        let handshake = Handshake {
            status,
            meta: None,
            override_id,
        };
        if !handshake.accepted() {
            debug!(connection_id, %status, "Join refused by downstream");
            return Ok(handshake);
        }
        Ok(Handshake {
            meta: meta_header(body)?,
            ..handshake
        })
    }

    /// Relay one client frame.
    pub async fn forward(
        &self,
        connection_id: &str,
        meta: Option<&HeaderValue>,
        frame: Frame,
    ) -> Result<StatusCode> {
        let headers = self.signed_headers(connection_id, meta)?;
        let response = self
            .client
            .post(&self.base_url)
            .headers(headers)
            .header(header::CONTENT_TYPE, frame.content_type())
            .body(frame.into_bytes())
            .send()
            .await?;
        Ok(response.status())
    }

    /// Tell downstream a connection has closed.
    pub async fn leave(&self, connection_id: &str, meta: Option<&HeaderValue>) -> Result<StatusCode> {
        let headers = self.signed_headers(connection_id, meta)?;
        let response = self
            .client
            .delete(&self.base_url)
            .headers(headers)
            .send()
            .await?;
        Ok(response.status())
    }

    fn signed_headers(&self, connection_id: &str, meta: Option<&HeaderValue>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(2);
        self.signer.sign_request(&mut headers, connection_id)?;
        if let Some(meta) = meta {
            headers.insert(META_HEADER, meta.clone());
        }
        Ok(headers)
    }
}

/// An empty body means no meta. Anything else must be a legal header value.
fn meta_header(body: Bytes) -> Result<Option<HeaderValue>> {
    if body.is_empty() {
        return Ok(None);
    }
    Ok(Some(HeaderValue::from_maybe_shared(body)?))
}
