//! Request signing protocol.
//!
//! Every HTTP call crossing the gateway/downstream boundary carries a token in
//! the [`AUTH_HEADER`] header:
//!
//! ```text
//! base64url(nonce "_" subject) "." base64url(ed25519(base64url(nonce "_" subject)))
//! ```
//!
//! The nonce is a UUIDv7 whose timestamp bounds the replay window. No
//! seen-nonce cache is kept, so a captured token stays replayable until its
//! nonce leaves the window; [`Verifier::with_window`] tunes that trade-off
//! against clock skew between the two sides.

use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::Signer as _;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use http::{HeaderMap, HeaderValue};
use tracing::debug;

use crate::error::{Result, SigningError};
use crate::ids::{nonce_time, random_nonce};

/// Header carrying the signed token.
pub const AUTH_HEADER: &str = "websocket-gateway-auth";

/// Path at which each side serves its public key.
pub const PUBLIC_KEY_PATH: &str = "/.well-known/public.txt";

/// Accepted distance between a nonce's timestamp and the verifier's clock.
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(60);

/// Produces tokens with a private key.
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Public half of the signing key.
    pub fn public_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Public key in the form served at [`PUBLIC_KEY_PATH`].
    pub fn encoded_public_key(&self) -> String {
        encode_public_key(&self.public_key())
    }

    /// Create a token asserting `subject`, stamped with the current time.
    pub fn sign(&self, subject: &str) -> Result<String> {
        self.sign_at(subject, Utc::now())
    }

    /// Create a token asserting `subject`, stamped with `at`.
    pub fn sign_at(&self, subject: &str, at: DateTime<Utc>) -> Result<String> {
        let nonce = random_nonce(at)?;
        let message = URL_SAFE_NO_PAD.encode(format!("{}_{}", nonce.simple(), subject));
        let signature = URL_SAFE_NO_PAD.encode(self.key.sign(message.as_bytes()).to_bytes());
        Ok(format!("{message}.{signature}"))
    }

    /// Attach a fresh token for `subject` to outgoing request headers.
    pub fn sign_request(&self, headers: &mut HeaderMap, subject: &str) -> Result<()> {
        let token = self.sign(subject)?;
        headers.insert(AUTH_HEADER, HeaderValue::from_str(&token)?);
        Ok(())
    }
}

/// Checks tokens against the peer's public key.
#[derive(Clone)]
pub struct Verifier {
    key: VerifyingKey,
    window: chrono::Duration,
}

impl Verifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self::with_window(key, DEFAULT_REPLAY_WINDOW)
    }

    pub fn with_window(key: VerifyingKey, window: Duration) -> Self {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(365));
        Self { key, window }
    }

    /// Verify the token in request headers. `None` means unauthenticated.
    pub fn verify_request(&self, headers: &HeaderMap) -> Option<String> {
        let token = headers.get(AUTH_HEADER)?.to_str().ok()?;
        self.verify(token)
    }

    /// Verify a token against the current time.
    pub fn verify(&self, token: &str) -> Option<String> {
        self.verify_at(token, Utc::now())
    }

    /// Verify a token, returning the subject it asserts.
    ///
    /// Every failure collapses to `None`; callers must treat that as
    /// unauthenticated.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Option<String> {
        let (message, signature) = exactly_two(token, '.')?;

        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        let signature = Signature::from_slice(&signature).ok()?;
        if self.key.verify_strict(message.as_bytes(), &signature).is_err() {
            debug!("token signature rejected");
            return None;
        }

        let message = URL_SAFE_NO_PAD.decode(message).ok()?;
        let message = String::from_utf8(message).ok()?;
        let (nonce, subject) = exactly_two(&message, '_')?;

        let issued = nonce_time(nonce)?;
        if issued < now - self.window || issued > now + self.window {
            debug!(%issued, "token outside replay window");
            return None;
        }

        if subject.is_empty() {
            return None;
        }
        Some(subject.to_string())
    }
}

fn exactly_two(text: &str, separator: char) -> Option<(&str, &str)> {
    let mut parts = text.split(separator);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(first), Some(second), None) => Some((first, second)),
        _ => None,
    }
}

/// Encode a public key as served at [`PUBLIC_KEY_PATH`].
pub fn encode_public_key(key: &VerifyingKey) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

/// Decode a public key fetched from a peer's [`PUBLIC_KEY_PATH`].
pub fn decode_public_key(text: &str) -> Result<VerifyingKey> {
    let bytes = URL_SAFE_NO_PAD.decode(text.trim())?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| SigningError::InvalidKey(format!("public key is {} bytes", b.len())))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| SigningError::InvalidKey(e.to_string()))
}

/// Decode a private key from configuration.
///
/// Accepts standard or URL-safe base64 of either a 32-byte seed or a 64-byte
/// seed-plus-public-key pair.
pub fn decode_signing_key(text: &str) -> Result<SigningKey> {
    let text = text.trim();
    let bytes = match STANDARD.decode(text) {
        Ok(bytes) => bytes,
        Err(_) => URL_SAFE_NO_PAD.decode(text)?,
    };

    match bytes.len() {
        32 => {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes);
            Ok(SigningKey::from_bytes(&seed))
        }
        64 => {
            let mut pair = [0u8; 64];
            pair.copy_from_slice(&bytes);
            SigningKey::from_keypair_bytes(&pair).map_err(|e| SigningError::InvalidKey(e.to_string()))
        }
        n => Err(SigningError::InvalidKey(format!("private key is {n} bytes"))),
    }
}
