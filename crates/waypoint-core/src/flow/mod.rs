//! Flow engine: blueprints, step execution, branching, pausing and the facade.
//!
//! - `blueprint` -- step/branch arena, builder, validation and the registry
//! - `handler` -- step bodies (`StepHandler`), outputs and step errors
//! - `context` -- per-step execution context rebuilt from the run record
//! - `retry` -- fixed-delay retry policy
//! - `middleware` -- hooks around every step invocation
//! - `step_executor` -- one step: data checks, idempotency, timeout, retries
//! - `branch` -- static branch selection and dynamic branch scheduling
//! - `checkpoint` -- persistence, audit and notification side effects
//! - `runtime` -- in-process run claims, cancellation tokens and snapshots
//! - `executor` -- the sequential/parallel walk over top-level steps
//! - `pause` -- timeout, condition and event driven resumes
//! - `engine` -- the `FlowEngine` facade

pub mod blueprint;
pub mod branch;
pub mod checkpoint;
pub mod context;
pub mod engine;
pub mod executor;
pub mod handler;
pub mod middleware;
pub mod pause;
pub mod retry;
pub mod runtime;
pub mod step_executor;
