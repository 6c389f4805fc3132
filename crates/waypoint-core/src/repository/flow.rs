//! Flow repository trait definition.
//!
//! Defines the storage interface for flow runs, their audit events and the
//! idempotency cache. The infrastructure layer (waypoint-infra) ships an
//! in-memory implementation; any durable store can implement the same port.

use chrono::{DateTime, Utc};
use uuid::Uuid;
use waypoint_types::error::RepositoryError;
use waypoint_types::event::FlowEvent;
use waypoint_types::flow::{FlowInstance, FlowStatus, FlowSummary, IdempotentRecord};
use waypoint_types::query::{FlowFilter, Page};

/// Repository trait for flow persistence.
///
/// Covers three entity families:
/// - **Runs:** load/save of `FlowInstance` records with optimistic versioning.
/// - **Events:** the append-only audit log of each run.
/// - **Idempotency:** cached step outcomes keyed by namespaced idempotency key.
///
/// `save_flow` must reject a write whose `flow.version` differs from the
/// stored version with `RepositoryError::Conflict(flow_id)`, and return the
/// new version otherwise. A record with version 0 is an insert.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait FlowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Get a flow run by its UUID.
    fn load_flow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<FlowInstance>, RepositoryError>> + Send;

    /// Insert or update a flow run. Returns the stored version.
    fn save_flow(
        &self,
        flow: &FlowInstance,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Status of a flow run without loading the whole record.
    fn get_flow_status(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<FlowStatus>, RepositoryError>> + Send;

    /// Mark a non-terminal run as cancelled. Returns `false` if the run is
    /// missing or already terminal.
    fn cancel_flow(
        &self,
        id: &Uuid,
        reason: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// List runs matching `filter`, newest first.
    fn query_flows(
        &self,
        filter: &FlowFilter,
    ) -> impl std::future::Future<Output = Result<Page<FlowSummary>, RepositoryError>> + Send;

    /// Paused runs whose pause carries a timeout trigger.
    fn get_paused_flows_for_auto_resume(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<FlowInstance>, RepositoryError>> + Send;

    /// Every paused run.
    fn list_paused_flows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<FlowInstance>, RepositoryError>> + Send;

    /// Delete terminal runs (and their events) completed before `older_than`.
    /// Returns the number of runs removed.
    fn cleanup_completed(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<usize, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Append an audit event.
    fn save_event(
        &self,
        event: &FlowEvent,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All audit events of a run, oldest first.
    fn get_events(
        &self,
        flow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<FlowEvent>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Idempotency
    // -----------------------------------------------------------------------

    fn get_idempotent_result(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<IdempotentRecord>, RepositoryError>> + Send;

    fn save_idempotent_result(
        &self,
        key: &str,
        record: &IdempotentRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
