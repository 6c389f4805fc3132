//! Engine configuration types.
//!
//! `EngineConfig` mirrors the `[engine]` and `[security]` tables of
//! `waypoint.toml`. Every field has a default so an empty file is valid.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime configuration for the flow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on `JumpTo` redirections per run.
    #[serde(default = "default_max_jumps")]
    pub max_jumps: u32,

    /// Interval of the background auto-resume sweep.
    #[serde(default = "default_auto_resume_interval_secs")]
    pub auto_resume_interval_secs: u64,

    /// Maximum age of a signed event before it is rejected.
    #[serde(default = "default_event_ttl_secs")]
    pub event_ttl_secs: u64,

    /// Capacity of the notification broadcast channel.
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,

    /// Reject blueprints with condition-only branch sets (no default branch).
    #[serde(default)]
    pub strict_branching: bool,

    /// Maximum serialized size of a flow's initial data.
    #[serde(default = "default_max_initial_data_bytes")]
    pub max_initial_data_bytes: usize,

    /// Age after which terminal flows are eligible for cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    #[serde(default)]
    pub security: SecurityConfig,
}

fn default_max_jumps() -> u32 {
    100
}

fn default_auto_resume_interval_secs() -> u64 {
    60
}

fn default_event_ttl_secs() -> u64 {
    300
}

fn default_notification_capacity() -> usize {
    1024
}

fn default_max_initial_data_bytes() -> usize {
    1_048_576
}

fn default_retention_days() -> u32 {
    30
}

fn default_page_size() -> usize {
    50
}

fn default_max_page_size() -> usize {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_jumps: default_max_jumps(),
            auto_resume_interval_secs: default_auto_resume_interval_secs(),
            event_ttl_secs: default_event_ttl_secs(),
            notification_capacity: default_notification_capacity(),
            strict_branching: false,
            max_initial_data_bytes: default_max_initial_data_bytes(),
            retention_days: default_retention_days(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            security: SecurityConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn auto_resume_interval(&self) -> Duration {
        Duration::from_secs(self.auto_resume_interval_secs.max(1))
    }

    pub fn event_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.event_ttl_secs).unwrap_or(i64::MAX / 1000))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    /// Clamp a requested page size into `1..=max_page_size`.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size.max(1))
    }
}

/// Authorisation policy consumed by the policy security gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Users allowed to act on any flow.
    #[serde(default)]
    pub admin_users: Vec<String>,

    /// Flow type -> users allowed to start it. Types not listed are open.
    #[serde(default)]
    pub flow_type_grants: BTreeMap<String, Vec<String>>,

    /// Publishers whose signed events may resume flows. Empty means any.
    #[serde(default)]
    pub trusted_publishers: Vec<String>,
}

impl SecurityConfig {
    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admin_users.iter().any(|u| u == user_id)
    }
}
