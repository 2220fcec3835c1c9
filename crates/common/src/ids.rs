//! Time-ordered identifiers.
//!
//! Connection ids, instance ids and token nonces are all UUIDv7: a 48-bit
//! millisecond timestamp followed by random bits. Sorting by id sorts by
//! creation time, and the creation time can be read back out of the id.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::TryRngCore;
use uuid::{Builder, Uuid, Version};

use crate::error::{Result, SigningError};

/// Generate a fresh fleet-unique identifier.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Build an unpredictable nonce stamped with `at`.
///
/// The random part comes straight from the OS source, so exhaustion surfaces
/// as an error instead of a weaker nonce.
pub fn random_nonce(at: DateTime<Utc>) -> Result<Uuid> {
    let mut random = [0u8; 10];
    OsRng
        .try_fill_bytes(&mut random)
        .map_err(|e| SigningError::Randomness(e.to_string()))?;

    let millis = u64::try_from(at.timestamp_millis()).unwrap_or(0);
    Ok(Builder::from_unix_timestamp_millis(millis, &random).into_uuid())
}

/// Read the creation time embedded in a nonce.
///
/// Returns `None` for anything that is not a well-formed UUIDv7.
pub fn nonce_time(text: &str) -> Option<DateTime<Utc>> {
    let nonce = Uuid::try_parse(text).ok()?;
    if nonce.get_version() != Some(Version::SortRand) {
        return None;
    }

    let (secs, nanos) = nonce.get_timestamp()?.to_unix();
    DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
}
