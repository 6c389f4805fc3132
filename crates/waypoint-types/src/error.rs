use thiserror::Error;
use uuid::Uuid;

use crate::flow::FlowStatus;

/// Errors from repository operations (used by the persistence port in waypoint-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage unavailable")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("version conflict: {0}")]
    Conflict(String),
}

/// Errors surfaced by the engine facade.
///
/// `Validation` and `Unauthorized` are returned synchronously and never
/// retried. `Timeout` and `StepExecutionFailed` describe step failures that
/// already exhausted their retry policy. `MaxJumpsExceeded` is always fatal.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("flow not found: {0}")]
    NotFound(Uuid),

    #[error("unknown flow type: {0}")]
    UnknownFlowType(String),

    #[error("invalid flow definition '{flow_type}': {reason}")]
    InvalidDefinition { flow_type: String, reason: String },

    #[error("step '{step}' timed out")]
    Timeout { step: String },

    #[error("flow {flow_id} exceeded the maximum of {max} jumps")]
    MaxJumpsExceeded { flow_id: Uuid, max: u32 },

    #[error("step '{step}' failed: {error}")]
    StepExecutionFailed { step: String, error: String },

    #[error("concurrent operation on flow {0}")]
    ConcurrencyConflict(Uuid),

    #[error("flow {flow_id} cannot move from {from} to {to}")]
    InvalidTransition {
        flow_id: Uuid,
        from: FlowStatus,
        to: FlowStatus,
    },

    #[error("event rejected: {0}")]
    EventRejected(String),

    #[error("repository error: {0}")]
    Repository(RepositoryError),
}

impl From<RepositoryError> for EngineError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Conflict(msg) => match msg.parse::<Uuid>() {
                Ok(id) => EngineError::ConcurrencyConflict(id),
                Err(_) => EngineError::Repository(RepositoryError::Conflict(msg)),
            },
            other => EngineError::Repository(other),
        }
    }
}

impl EngineError {
    /// Whether the caller may reasonably retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ConcurrencyConflict(_)
                | EngineError::Repository(RepositoryError::Connection)
        )
    }

    /// Short machine-readable code, used in audit payloads.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::NotFound(_) => "not_found",
            EngineError::UnknownFlowType(_) => "unknown_flow_type",
            EngineError::InvalidDefinition { .. } => "invalid_definition",
            EngineError::Timeout { .. } => "timeout",
            EngineError::MaxJumpsExceeded { .. } => "max_jumps_exceeded",
            EngineError::StepExecutionFailed { .. } => "step_execution_failed",
            EngineError::ConcurrencyConflict(_) => "concurrency_conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::EventRejected(_) => "event_rejected",
            EngineError::Repository(_) => "repository",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("bad filter".to_string());
        assert_eq!(err.to_string(), "query error: bad filter");
    }

    #[test]
    fn test_validation_error_joins_messages() {
        let err = EngineError::Validation(vec!["amount missing".into(), "currency bad".into()]);
        assert_eq!(
            err.to_string(),
            "validation failed: amount missing; currency bad"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_conflict_with_flow_id_maps_to_concurrency_conflict() {
        let id = Uuid::now_v7();
        let err: EngineError = RepositoryError::Conflict(id.to_string()).into();
        assert!(matches!(err, EngineError::ConcurrencyConflict(got) if got == id));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_codes() {
        let err = EngineError::MaxJumpsExceeded {
            flow_id: Uuid::nil(),
            max: 3,
        };
        assert_eq!(err.code(), "max_jumps_exceeded");
        assert!(err.to_string().contains("3 jumps"));
    }
}
