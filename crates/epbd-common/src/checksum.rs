//! Payload digests
//!
//! Every mutation payload that reaches the store is fingerprinted so a log
//! line can be matched against the archive the provider published.

use sha2::{Digest, Sha256};

/// SHA-256 of an in-memory payload, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Short form used in log lines.
pub fn short_digest(data: &[u8]) -> String {
    let mut digest = sha256_hex(data);
    digest.truncate(12);
    digest
}
