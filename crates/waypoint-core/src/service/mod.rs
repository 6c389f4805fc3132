//! Service ports consumed by the engine.
//!
//! - `hash` -- content hashing for audit payloads
//! - `security` -- authorisation and event signing
//! - `validation` -- initial data validation

pub mod hash;
pub mod security;
pub mod validation;
