//! Shared pieces of the WebSocket gateway protocol.
//!
//! Both the gateway and the downstream service sign every HTTP call they make
//! to each other and verify every call they receive. This crate holds that
//! signing protocol plus the time-ordered identifiers it relies on, so a
//! downstream written in Rust can depend on it directly.

pub mod auth;
pub mod error;
pub mod ids;

pub use auth::{
    decode_public_key, decode_signing_key, encode_public_key, Signer, Verifier, AUTH_HEADER,
    DEFAULT_REPLAY_WINDOW, PUBLIC_KEY_PATH,
};
pub use error::{Result, SigningError};
pub use ids::{new_id, nonce_time, random_nonce};
