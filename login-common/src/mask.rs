//! # Mask
//!
//! One-way masking of personally identifiable fields.
//!
//! Masked values are lower case hex encoded SHA-256 digests. Identical inputs always produce
//! identical digests, so masked columns can still be joined on downstream without having to
//! store the original values.
use sha2::{Digest, Sha256};

/// Length in characters of every value returned by `mask`.
pub const MASKED_LENGTH: usize = 64;

/// Mask a value by hashing it. Never fails, including for the empty string.
pub fn mask(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}
