//! Request fingerprints.
//!
//! A fingerprint is `sha256:<hex>` over a versioned prefix followed by the
//! canonical JSON of the normalized [`GenerationParams`]. Canonical JSON
//! sorts keys and rejects floats, so equal parameters always hash equally.

use sha2::{Digest, Sha256};

use spool_core::canonical_json::to_canonical_bytes;

use crate::error::{Error, Result};
use crate::task::GenerationParams;

const PREIMAGE_PREFIX: &[u8] = b"spool-request:v1:";
const ALGORITHM_PREFIX: &str = "sha256:";

/// Computes the fingerprint of normalized parameters.
///
/// # Errors
///
/// Returns `Error::Serialization` if the parameters cannot be encoded.
pub fn fingerprint(params: &GenerationParams) -> Result<String> {
    let canonical = to_canonical_bytes(params).map_err(Error::serialization)?;
    let mut hasher = Sha256::new();
    hasher.update(PREIMAGE_PREFIX);
    hasher.update(&canonical);
    Ok(format!("{ALGORITHM_PREFIX}{}", hex::encode(hasher.finalize())))
}

/// Returns the hex digest part of a fingerprint, for use in storage keys.
///
/// # Errors
///
/// Returns `Error::Validation` if the value is not a `sha256:` fingerprint.
pub fn digest(fingerprint: &str) -> Result<&str> {
    fingerprint
        .strip_prefix(ALGORITHM_PREFIX)
        .filter(|hex| hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
        .ok_or_else(|| Error::validation(format!("malformed fingerprint '{fingerprint}'")))
}
