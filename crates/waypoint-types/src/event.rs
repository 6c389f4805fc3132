//! Audit events, signed external events and live notifications.
//!
//! - `FlowEvent` is the append-only audit record of a run.
//! - `SignedEvent` is an externally published event that can drive an
//!   event-based resume once its signature has been verified.
//! - `FlowNotification` is what live observers receive on the notification bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::flow::{FlowDetail, StepStatus};

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// Kind of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEventType {
    Created,
    StepAttempted,
    StepCacheHit,
    StepCompleted,
    StepFailed,
    StepSkipped,
    BranchSkipped,
    Jumped,
    Paused,
    Resumed,
    ResumeRejected,
    Completed,
    Failed,
    Cancelled,
    ChildTriggered,
    FireFailed,
}

/// Append-only audit entry for a flow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub event_type: FlowEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl FlowEvent {
    pub fn new(flow_id: Uuid, event_type: FlowEventType, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            flow_id,
            event_type,
            user_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn by(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Signed events
// ---------------------------------------------------------------------------

/// An externally published event carrying a verifiable signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEvent {
    pub id: Uuid,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    pub publisher_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Lowercase hex signature over [`SignedEvent::signing_input`].
    pub signature: String,
    /// Identifier of the key that produced `signature`.
    pub key_id: String,
}

impl SignedEvent {
    /// Canonical byte string covered by the signature.
    ///
    /// Fields are joined with `\n`; the payload is compact JSON.
    pub fn signing_input(
        id: Uuid,
        event_type: &str,
        payload: &Value,
        publisher_id: &str,
        correlation_id: Option<&str>,
        timestamp: DateTime<Utc>,
        key_id: &str,
    ) -> Vec<u8> {
        format!(
            "{id}\n{event_type}\n{publisher_id}\n{}\n{}\n{key_id}\n{payload}",
            correlation_id.unwrap_or(""),
            timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        )
        .into_bytes()
    }

    /// Signing input for this event's own fields.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        Self::signing_input(
            self.id,
            &self.event_type,
            &self.payload,
            &self.publisher_id,
            self.correlation_id.as_deref(),
            self.timestamp,
            &self.key_id,
        )
    }

    /// Events older than `ttl` (or dated in the future beyond `ttl`) are expired.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        let age = now.signed_duration_since(self.timestamp);
        age > ttl || age < -ttl
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Messages broadcast to live observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowNotification {
    /// A flow changed status (or persisted a new snapshot).
    StatusChanged { detail: Box<FlowDetail> },
    /// A step changed status.
    StepChanged {
        flow_id: Uuid,
        step: String,
        status: StepStatus,
    },
    /// A flow hit an error.
    Error { flow_id: Uuid, message: String },
    /// A signed event was published through the engine.
    EventPublished {
        event_id: Uuid,
        event_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
}

impl FlowNotification {
    /// Flow the notification refers to, if any.
    pub fn flow_id(&self) -> Option<Uuid> {
        match self {
            FlowNotification::StatusChanged { detail } => Some(detail.id),
            FlowNotification::StepChanged { flow_id, .. }
            | FlowNotification::Error { flow_id, .. } => Some(*flow_id),
            FlowNotification::EventPublished { .. } => None,
        }
    }
}
