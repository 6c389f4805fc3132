//! Flow run state.
//!
//! `FlowInstance` is the durable record of one run of a registered flow type.
//! It is the only thing the persistence port stores: the executable shape of
//! the flow (step bodies, predicates, branch factories) lives in the
//! blueprint registered with the engine, and the execution context is
//! rebuilt from this record on every (re-)entry.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::event::FlowEvent;
use crate::resume::ResumeConfig;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle status of a flow run.
///
/// `Initializing -> Ready -> Running -> {Paused <-> Running} -> {Completed | Failed | Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Initializing,
    Ready,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl FlowStatus {
    /// Completed, Failed and Cancelled are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: FlowStatus) -> bool {
        use FlowStatus::*;
        match self {
            Initializing => matches!(next, Ready | Failed | Cancelled),
            Ready => matches!(next, Running | Failed | Cancelled),
            Running => matches!(next, Paused | Completed | Failed | Cancelled),
            Paused => matches!(next, Running | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowStatus::Initializing => "initializing",
            FlowStatus::Ready => "ready",
            FlowStatus::Running => "running",
            FlowStatus::Paused => "paused",
            FlowStatus::Completed => "completed",
            FlowStatus::Failed => "failed",
            FlowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

// ---------------------------------------------------------------------------
// Data typing
// ---------------------------------------------------------------------------

/// Expected JSON type of a required data-bag entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Any,
    String,
    Number,
    Integer,
    Bool,
    Object,
    Array,
}

impl DataType {
    /// Check whether `value` has this type. `Null` never matches.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            DataType::Any => !value.is_null(),
            DataType::String => value.is_string(),
            DataType::Number => value.is_number(),
            DataType::Integer => value.is_i64() || value.is_u64(),
            DataType::Bool => value.is_boolean(),
            DataType::Object => value.is_object(),
            DataType::Array => value.is_array(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Any => "any",
            DataType::String => "string",
            DataType::Number => "number",
            DataType::Integer => "integer",
            DataType::Bool => "bool",
            DataType::Object => "object",
            DataType::Array => "array",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// Recorded outcome of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl StepResult {
    pub fn success(message: Option<String>, payload: Option<Value>) -> Self {
        Self {
            success: true,
            message,
            payload,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            payload: None,
        }
    }
}

/// Cached outcome of an idempotent step, keyed by `"{flow_type}:{key}"`.
///
/// Carries the data-bag updates the step produced so a cache hit restores
/// them without re-running the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotentRecord {
    pub result: StepResult,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

impl IdempotentRecord {
    pub fn new(result: StepResult, data: BTreeMap<String, Value>) -> Self {
        Self {
            result,
            data,
            recorded_at: Utc::now(),
        }
    }
}

/// Per-step execution state kept inside the flow record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    /// Attempts made during the latest execution of this step.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepState {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            result: None,
            attempts: 0,
            last_error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Return the step to `Pending`, discarding its previous outcome.
    pub fn reset(&mut self) {
        let name = std::mem::take(&mut self.name);
        *self = StepState::pending(name);
    }
}

// ---------------------------------------------------------------------------
// FlowInstance
// ---------------------------------------------------------------------------

/// Durable state of one flow run.
///
/// Invariant: `current_step_index <= steps.len()`; equality means the walk
/// reached the end of the step list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowInstance {
    pub id: Uuid,
    /// Registered flow type name (blueprint key).
    pub flow_type: String,
    /// Owner of the run.
    pub user_id: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_flow_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    pub status: FlowStatus,
    pub current_step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,
    /// One entry per top-level blueprint step, in declaration order.
    pub steps: Vec<StepState>,
    /// Resume triggers of the current pause, if paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_resume: Option<ResumeConfig>,
    /// Step index whose pause gate was cleared by the last resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<usize>,
    /// The flow's data bag.
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    /// Append-only event log of this run.
    #[serde(default)]
    pub events: Vec<FlowEvent>,
    #[serde(default)]
    pub jump_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Optimistic concurrency version. 0 means never persisted.
    #[serde(default)]
    pub version: u64,
}

impl FlowInstance {
    /// Create a new run record in `Initializing` state.
    pub fn new(
        id: Uuid,
        flow_type: impl Into<String>,
        user_id: impl Into<String>,
        correlation_id: impl Into<String>,
        step_names: impl IntoIterator<Item = String>,
        data: BTreeMap<String, Value>,
    ) -> Self {
        let steps: Vec<StepState> = step_names.into_iter().map(StepState::pending).collect();
        let current_step_name = steps.first().map(|s| s.name.clone());
        Self {
            id,
            flow_type: flow_type.into(),
            user_id: user_id.into(),
            correlation_id: correlation_id.into(),
            parent_flow_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            paused_at: None,
            status: FlowStatus::Initializing,
            current_step_index: 0,
            current_step_name,
            steps,
            active_resume: None,
            resume_token: None,
            data,
            events: Vec::new(),
            jump_count: 0,
            last_error: None,
            version: 0,
        }
    }

    /// Whether the step pointer has walked past the last step.
    pub fn is_at_end(&self) -> bool {
        self.current_step_index >= self.steps.len()
    }

    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Move the step pointer, keeping `current_step_name` in sync.
    ///
    /// Indices past the end are clamped to `steps.len()`.
    pub fn set_current_step(&mut self, index: usize) {
        let index = index.min(self.steps.len());
        self.current_step_index = index;
        self.current_step_name = self.steps.get(index).map(|s| s.name.clone());
    }

    /// Apply a status transition, stamping the matching timestamp.
    pub fn transition(&mut self, next: FlowStatus) -> Result<(), EngineError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                flow_id: self.id,
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            FlowStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                self.paused_at = None;
            }
            FlowStatus::Paused => self.paused_at = Some(now),
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled => {
                self.completed_at = Some(now);
                self.active_resume = None;
            }
            FlowStatus::Initializing | FlowStatus::Ready => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn summary(&self) -> FlowSummary {
        FlowSummary {
            id: self.id,
            flow_type: self.flow_type.clone(),
            user_id: self.user_id.clone(),
            correlation_id: self.correlation_id.clone(),
            status: self.status,
            current_step_name: self.current_step_name.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
            last_error: self.last_error.clone(),
        }
    }

    /// Full snapshot for live observers.
    pub fn detail(&self) -> FlowDetail {
        FlowDetail {
            id: self.id,
            flow_type: self.flow_type.clone(),
            status: self.status,
            current_step: self.current_step_name.clone(),
            steps: self.steps.clone(),
            events: self.events.clone(),
            data: self.data.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Listing row returned by flow queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    pub id: Uuid,
    pub flow_type: String,
    pub user_id: String,
    pub correlation_id: String,
    pub status: FlowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Detail object published to live observers on every status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDetail {
    pub id: Uuid,
    pub flow_type: String,
    pub status: FlowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub steps: Vec<StepState>,
    pub events: Vec<FlowEvent>,
    pub data: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
