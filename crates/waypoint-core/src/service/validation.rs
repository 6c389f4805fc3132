//! DataValidator trait for checking a flow's initial data.

use std::collections::BTreeMap;

use serde_json::Value;

/// Outcome of validating initial data. Empty `errors` means valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn push(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
    }
}

/// Validates the initial data of a flow before it is created.
pub trait DataValidator: Send + Sync {
    fn validate_initial_data(
        &self,
        flow_type: &str,
        data: &BTreeMap<String, Value>,
    ) -> ValidationReport;
}

/// Validator that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl DataValidator for AcceptAll {
    fn validate_initial_data(
        &self,
        _flow_type: &str,
        _data: &BTreeMap<String, Value>,
    ) -> ValidationReport {
        ValidationReport::ok()
    }
}
