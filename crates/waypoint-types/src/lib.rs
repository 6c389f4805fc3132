//! Shared domain types for Waypoint.
//!
//! This crate contains the serialisable side of the flow engine: persisted
//! run state, resume configuration, audit and signed events, query filters,
//! notifications, engine configuration and the error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod query;
pub mod resume;
