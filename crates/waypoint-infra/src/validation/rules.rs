//! Rule-based validation of a flow's initial data.
//!
//! Rules are registered per flow type; rules registered for every type apply
//! first. All violations are collected so the caller sees the complete list
//! in one `EngineError::Validation`.
//!
//! Checks performed for every flow type:
//! - Data keys are non-empty and use only alphanumerics, `_`, `-` and `.`
//!
//! Checks available per flow type:
//! - A key is present with the expected [`DataType`]
//! - A string value does not exceed a maximum length
//! - A numeric value lies within an inclusive range
//! - A value is one of an allowed set

use std::collections::BTreeMap;

use serde_json::Value;
use waypoint_core::service::validation::{DataValidator, ValidationReport};
use waypoint_types::flow::DataType;

/// A single initial-data constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum DataRule {
    Required { key: String, data_type: DataType },
    MaxLength { key: String, max: usize },
    Range { key: String, min: f64, max: f64 },
    OneOf { key: String, allowed: Vec<Value> },
}

impl DataRule {
    pub fn required(key: impl Into<String>, data_type: DataType) -> Self {
        DataRule::Required {
            key: key.into(),
            data_type,
        }
    }

    pub fn max_length(key: impl Into<String>, max: usize) -> Self {
        DataRule::MaxLength {
            key: key.into(),
            max,
        }
    }

    pub fn range(key: impl Into<String>, min: f64, max: f64) -> Self {
        DataRule::Range {
            key: key.into(),
            min,
            max,
        }
    }

    pub fn one_of(key: impl Into<String>, allowed: impl IntoIterator<Item = Value>) -> Self {
        DataRule::OneOf {
            key: key.into(),
            allowed: allowed.into_iter().collect(),
        }
    }

    fn check(&self, data: &BTreeMap<String, Value>, report: &mut ValidationReport) {
        match self {
            DataRule::Required { key, data_type } => match data.get(key) {
                None => report.push(format!("'{key}' is required")),
                Some(value) if !data_type.matches(value) => {
                    report.push(format!("'{key}' must be of type {data_type}"))
                }
                Some(_) => {}
            },
            DataRule::MaxLength { key, max } => {
                if let Some(Value::String(s)) = data.get(key) {
                    let len = s.chars().count();
                    if len > *max {
                        report.push(format!("'{key}' is {len} characters, maximum is {max}"));
                    }
                }
            }
            DataRule::Range { key, min, max } => {
                if let Some(value) = data.get(key) {
                    match value.as_f64() {
                        Some(n) if n < *min || n > *max => {
                            report.push(format!("'{key}' must be between {min} and {max}"))
                        }
                        Some(_) => {}
                        None => report.push(format!("'{key}' must be a number")),
                    }
                }
            }
            DataRule::OneOf { key, allowed } => {
                if let Some(value) = data.get(key) {
                    if !allowed.contains(value) {
                        report.push(format!("'{key}' has a value outside the allowed set"));
                    }
                }
            }
        }
    }
}

/// `DataValidator` driven by registered [`DataRule`]s.
#[derive(Debug, Clone, Default)]
pub struct RuleValidator {
    global: Vec<DataRule>,
    by_flow_type: BTreeMap<String, Vec<DataRule>>,
}

impl RuleValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule applied to every flow type.
    pub fn global(mut self, rule: DataRule) -> Self {
        self.global.push(rule);
        self
    }

    /// Add a rule for `flow_type`.
    pub fn rule(mut self, flow_type: impl Into<String>, rule: DataRule) -> Self {
        self.by_flow_type
            .entry(flow_type.into())
            .or_default()
            .push(rule);
        self
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

impl DataValidator for RuleValidator {
    fn validate_initial_data(
        &self,
        flow_type: &str,
        data: &BTreeMap<String, Value>,
    ) -> ValidationReport {
        let mut report = ValidationReport::ok();

        for key in data.keys().filter(|k| !is_valid_key(k)) {
            report.push(format!("data key '{key}' contains invalid characters"));
        }

        let typed = self.by_flow_type.get(flow_type).into_iter().flatten();
        for rule in self.global.iter().chain(typed) {
            rule.check(data, &mut report);
        }

        if !report.is_valid() {
            tracing::debug!(flow_type, errors = report.errors.len(), "initial data rejected");
        }
        report
    }
}
