//! Hashing for change detection.
//!
//! Resource inputs and whole plans are hashed over their canonical
//! JSON form (object keys sorted), so equal inputs always produce equal
//! hashes regardless of how they were built. Everything hashed is already a
//! `serde_json::Value`, so hashing cannot fail.

use sha2::{Digest, Sha256};

/// Hasher for computing input and configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Hashes a resolved JSON value.
    #[must_use]
    pub fn hash_value(&self, value: &serde_json::Value) -> String {
        self.hash_str(&value.to_string())
    }

    /// Hashes raw bytes.
    #[must_use]
    pub fn hash_bytes(&self, bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Hashes a string.
    #[must_use]
    pub fn hash_str(&self, s: &str) -> String {
        self.hash_bytes(s.as_bytes())
    }

    /// Computes a short hash (first 8 characters) for display and name suffixes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
