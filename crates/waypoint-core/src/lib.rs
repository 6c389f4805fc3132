//! Core engine for Waypoint durable flows.
//!
//! Holds the port traits (repository, security gate, data validator, content
//! hasher) and everything that drives a run: blueprints, the step executor,
//! branch scheduling, the flow executor, the pause monitor and the
//! `FlowEngine` facade. Infrastructure adapters live in `waypoint-infra`.

pub mod event;
pub mod flow;
pub mod repository;
pub mod service;

pub use flow::engine::{FlowEngine, FlowEngineBuilder};
