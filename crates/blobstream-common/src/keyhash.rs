//! Stable key derivation for checkpoint records
//!
//! Checkpoint backends address records by string key. Object keys can contain
//! characters a backend may reject and can be arbitrarily long, so persisted
//! record keys are derived as a hex digest of the logical name.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the input
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Derive a backend key from a record-family prefix and a logical name.
///
/// The prefix keeps record families (object checkpoints, bucket indexes,
/// migration markers) from colliding in a shared collection.
pub fn derive_key(prefix: &str, name: &str) -> String {
    format!("{}-{}", prefix, sha256_hex(name.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_derive_key_is_stable_and_prefixed() {
        let a = derive_key("obj", "logs/2024/01/app.gz");
        let b = derive_key("obj", "logs/2024/01/app.gz");
        let c = derive_key("bucket", "logs/2024/01/app.gz");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("obj-"));
        assert_eq!(a.len(), "obj-".len() + 64);
    }
}
