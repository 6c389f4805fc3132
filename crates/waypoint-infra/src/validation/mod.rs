//! Initial-data validation adapters.

pub mod rules;

pub use rules::{DataRule, RuleValidator};
