//! Content hashing for change scripts and advisory lock keys

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of a script's bytes
pub fn script_hash(script: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script);
    hex::encode(hasher.finalize())
}

/// Advisory lock key for a named resource
///
/// Derived from the first eight bytes of the SHA-256 of `namespace:name`, so the
/// key is stable across PostgreSQL versions (unlike `hashtext`).
pub fn advisory_key(namespace: &str, name: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
