//! Error types for key handling and token signing.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SigningError {
    /// The OS random source could not produce nonce bytes.
    #[error("nonce generation failed: {0}")]
    Randomness(String),

    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// Key material had the wrong length or was not a valid curve point.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, SigningError>;
