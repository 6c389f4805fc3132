//! Observability setup for processes hosting the Waypoint engine.
//!
//! The engine crates only emit `tracing` events and spans; installing a
//! subscriber is left to the host, which calls [`tracing_setup::init_tracing`]
//! once at startup.

pub mod tracing_setup;
