//! SHA-256 helpers over canonical bytes.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{CanonicalError, canonical_json};

/// Prefix applied by [`format_hash`].
pub const HASH_PREFIX: &str = "sha256:";

/// Hashes raw bytes and returns lowercase hex.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hashes the canonical serialization of a JSON value.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the value is outside the canonical profile.
pub fn sha256_json(value: &Value) -> Result<String, CanonicalError> {
    Ok(sha256_hex(&canonical_json(value)?))
}

/// Formats a hex digest as `sha256:<hex>`.
#[must_use]
pub fn format_hash(hex_digest: &str) -> String {
    format!("{HASH_PREFIX}{hex_digest}")
}
