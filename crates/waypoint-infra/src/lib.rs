//! Infrastructure layer for Waypoint.
//!
//! Implementations of the ports defined in `waypoint-core`: an in-memory
//! flow repository with optimistic versioning, HMAC-SHA256 event signing, a
//! policy-driven security gate, a rule-based initial-data validator, SHA-256
//! content hashing and the TOML configuration loader.

pub mod config;
pub mod crypto;
pub mod repository;
pub mod security;
pub mod validation;
