//! ContentHasher trait for computing integrity hashes.
//!
//! Defined in waypoint-core so the engine can fingerprint initial data
//! without coupling to a specific hashing algorithm. The
//! `Sha256ContentHasher` adapter lives in waypoint-infra.

/// Abstraction over content hashing.
///
/// The engine records the hash of a flow's initial data in the `Created`
/// audit event instead of the raw data.
pub trait ContentHasher: Send + Sync {
    /// Compute a hex-encoded hash of the given content.
    fn compute_hash(&self, content: &str) -> String;
}
