//! Repository implementations of the `waypoint-core` storage ports.

pub mod memory;

pub use memory::InMemoryFlowRepository;
