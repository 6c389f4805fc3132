//! Pause reasons and resume triggers.
//!
//! A paused flow carries a `ResumeConfig` describing which triggers may bring
//! it back to `Running`: a timeout, one or more event types, and/or a manual
//! resume. Predicates over event payloads are code and live on the blueprint
//! step; this is the serialisable half that is persisted with the run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a flow was paused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Manual,
    Event,
    Timeout,
    Approval,
    Compliance,
    RateLimit,
    ExternalDependency,
    Other(String),
}

/// Triggers that may resume a paused flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeConfig {
    pub reason: PauseReason,
    /// Pause duration in milliseconds after which the timeout trigger fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// When the timeout elapses: resume (`true`) or expire the pause (`false`).
    #[serde(default)]
    pub resume_on_timeout: bool,
    /// Event types that may resume the flow.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<String>,
    /// Whether an authorised user may resume the flow by hand.
    #[serde(default = "default_allow_manual")]
    pub allow_manual: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_allow_manual() -> bool {
    true
}

impl ResumeConfig {
    /// Manual-only resume.
    pub fn manual() -> Self {
        Self {
            reason: PauseReason::Manual,
            timeout_ms: None,
            resume_on_timeout: false,
            event_types: Vec::new(),
            allow_manual: true,
            message: None,
        }
    }

    /// Resume automatically once `timeout` has elapsed.
    pub fn after(timeout: Duration) -> Self {
        Self {
            reason: PauseReason::Timeout,
            timeout_ms: Some(duration_to_millis(timeout)),
            resume_on_timeout: true,
            ..Self::manual()
        }
    }

    /// Resume when an event of one of `event_types` is published.
    pub fn on_events<I, S>(event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reason: PauseReason::Event,
            event_types: event_types.into_iter().map(Into::into).collect(),
            ..Self::manual()
        }
    }

    pub fn with_reason(mut self, reason: PauseReason) -> Self {
        self.reason = reason;
        self
    }

    /// Add a deadline. `resume` chooses between resuming and expiring.
    pub fn with_timeout(mut self, timeout: Duration, resume: bool) -> Self {
        self.timeout_ms = Some(duration_to_millis(timeout));
        self.resume_on_timeout = resume;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn without_manual(mut self) -> Self {
        self.allow_manual = false;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Instant at which the timeout trigger fires for a pause started at `paused_at`.
    pub fn deadline(&self, paused_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ms = i64::try_from(self.timeout_ms?).ok()?;
        paused_at.checked_add_signed(chrono::Duration::milliseconds(ms))
    }

    /// Whether the timeout has been reached at `now` (inclusive boundary).
    pub fn is_timeout_due(&self, paused_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.deadline(paused_at).is_some_and(|deadline| now >= deadline)
    }

    pub fn accepts_event(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|t| t == event_type)
    }

    /// Whether the periodic checker has anything to evaluate for this pause.
    pub fn has_timeout(&self) -> bool {
        self.timeout_ms.is_some()
    }
}

fn duration_to_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
