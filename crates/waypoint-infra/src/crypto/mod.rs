//! Cryptographic operations for Waypoint.
//!
//! - `hash`: SHA-256 content hashing for audit-safe data fingerprints

pub mod hash;
