//! Shared SHA-256 helpers.
//!
//! Used by the record table for slot hashing and by the event types for
//! de-duplication keys.

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// First four bytes of the SHA-256 digest as a big-endian integer.
pub fn sha256_prefix_u32(data: &[u8]) -> u32 {
    let hash = Sha256::digest(data);
    u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
}
