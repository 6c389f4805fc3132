//! SHA-256 content hashing.
//!
//! Implements the `ContentHasher` port from `waypoint-core`. The engine
//! records the hash of a flow's initial data in the `Created` audit event
//! instead of the data itself.

use sha2::{Digest, Sha256};

use waypoint_core::service::hash::ContentHasher;

/// Lowercase hex SHA-256 of the content.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256ContentHasher;

impl Sha256ContentHasher {
    pub fn new() -> Self {
        Self
    }
}

impl ContentHasher for Sha256ContentHasher {
    fn compute_hash(&self, content: &str) -> String {
        format!("{:x}", Sha256::digest(content.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_matches_known_digest() {
        assert_eq!(
            Sha256ContentHasher::new().compute_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn canonical_json_hashes_are_stable_and_distinct() {
        let hasher = Sha256ContentHasher::new();
        let a = hasher.compute_hash(r#"{"amount":42,"currency":"EUR"}"#);
        let b = hasher.compute_hash(r#"{"amount":42,"currency":"EUR"}"#);
        let c = hasher.compute_hash(r#"{"amount":43,"currency":"EUR"}"#);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
    }
}
