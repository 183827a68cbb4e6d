//! Stable 64-bit hashing of JSON values.
//!
//! Used where a hash ends up in a persisted value, so the result must not depend on the
//! toolchain or process.

use sha2::{Digest, Sha256};

/// Hashes the compact JSON rendering of `value` to the leading 64 bits of its SHA-256 digest.
///
/// `serde_json` keeps object keys sorted unless `preserve_order` is enabled, so equal values
/// hash equally.
pub fn stable_hash_json(value: &serde_json::Value) -> u64 {
    let digest = Sha256::digest(value.to_string().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);

    u64::from_be_bytes(prefix)
}
