//! In-memory flow repository.
//!
//! Implements `FlowRepository` from `waypoint-core` over `DashMap`s. Runs are
//! stored as whole `FlowInstance` records guarded by an optimistic version
//! counter, events as per-run append-only vectors, and idempotent step
//! outcomes under their namespaced key.
//!
//! Useful for tests, embedded single-process deployments and as the
//! reference behaviour for durable stores.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;
use waypoint_core::repository::flow::FlowRepository;
use waypoint_types::error::RepositoryError;
use waypoint_types::event::FlowEvent;
use waypoint_types::flow::{FlowInstance, FlowStatus, FlowSummary, IdempotentRecord};
use waypoint_types::query::{FlowFilter, Page};

/// `DashMap`-backed implementation of `FlowRepository`.
#[derive(Debug, Default)]
pub struct InMemoryFlowRepository {
    flows: DashMap<Uuid, FlowInstance>,
    events: DashMap<Uuid, Vec<FlowEvent>>,
    idempotency: DashMap<String, IdempotentRecord>,
}

impl InMemoryFlowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs.
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Number of cached idempotent outcomes.
    pub fn idempotent_count(&self) -> usize {
        self.idempotency.len()
    }

    fn paused_flows(&self, with_timeout_only: bool) -> Vec<FlowInstance> {
        let mut paused: Vec<FlowInstance> = self
            .flows
            .iter()
            .filter(|entry| entry.status == FlowStatus::Paused)
            .filter(|entry| {
                !with_timeout_only
                    || entry
                        .active_resume
                        .as_ref()
                        .is_some_and(|resume| resume.has_timeout())
            })
            .map(|entry| entry.value().clone())
            .collect();
        paused.sort_by_key(|flow| (flow.paused_at, flow.id));
        paused
    }
}

impl FlowRepository for InMemoryFlowRepository {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    async fn load_flow(&self, id: &Uuid) -> Result<Option<FlowInstance>, RepositoryError> {
        Ok(self.flows.get(id).map(|entry| entry.value().clone()))
    }

    async fn save_flow(&self, flow: &FlowInstance) -> Result<u64, RepositoryError> {
        match self.flows.entry(flow.id) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get().version;
                if stored != flow.version {
                    tracing::debug!(
                        flow_id = %flow.id,
                        stored,
                        presented = flow.version,
                        "optimistic version check failed"
                    );
                    return Err(RepositoryError::Conflict(flow.id.to_string()));
                }
                let mut record = flow.clone();
                record.version = stored + 1;
                occupied.insert(record);
                Ok(stored + 1)
            }
            Entry::Vacant(vacant) => {
                if flow.version != 0 {
                    // The run was deleted (cleanup) while someone still held it.
                    return Err(RepositoryError::Conflict(flow.id.to_string()));
                }
                let mut record = flow.clone();
                record.version = 1;
                vacant.insert(record);
                Ok(1)
            }
        }
    }

    async fn get_flow_status(&self, id: &Uuid) -> Result<Option<FlowStatus>, RepositoryError> {
        Ok(self.flows.get(id).map(|entry| entry.status))
    }

    async fn cancel_flow(&self, id: &Uuid, reason: &str) -> Result<bool, RepositoryError> {
        let Some(mut entry) = self.flows.get_mut(id) else {
            return Ok(false);
        };
        if entry.status.is_terminal() {
            return Ok(false);
        }
        let flow = entry.value_mut();
        flow.status = FlowStatus::Cancelled;
        flow.completed_at = Some(Utc::now());
        flow.active_resume = None;
        flow.last_error = Some(reason.to_string());
        flow.version += 1;
        Ok(true)
    }

    async fn query_flows(&self, filter: &FlowFilter) -> Result<Page<FlowSummary>, RepositoryError> {
        let mut matches: Vec<FlowSummary> = self
            .flows
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.summary())
            .collect();

        // Newest first; UUID v7 breaks ties in creation order.
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matches.len();
        let limit = filter.limit.unwrap_or(total);
        let items = matches
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .collect();

        Ok(Page {
            items,
            total,
            offset: filter.offset,
            limit,
        })
    }

    async fn get_paused_flows_for_auto_resume(&self) -> Result<Vec<FlowInstance>, RepositoryError> {
        Ok(self.paused_flows(true))
    }

    async fn list_paused_flows(&self) -> Result<Vec<FlowInstance>, RepositoryError> {
        Ok(self.paused_flows(false))
    }

    async fn cleanup_completed(&self, older_than: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let expired: Vec<Uuid> = self
            .flows
            .iter()
            .filter(|entry| {
                entry.status.is_terminal()
                    && entry.completed_at.is_some_and(|done| done < older_than)
            })
            .map(|entry| *entry.key())
            .collect();

        for id in &expired {
            self.flows.remove(id);
            self.events.remove(id);
        }
        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), %older_than, "cleaned up terminal flows");
        }
        Ok(expired.len())
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    async fn save_event(&self, event: &FlowEvent) -> Result<(), RepositoryError> {
        self.events
            .entry(event.flow_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn get_events(&self, flow_id: &Uuid) -> Result<Vec<FlowEvent>, RepositoryError> {
        Ok(self
            .events
            .get(flow_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    // -----------------------------------------------------------------------
    // Idempotency
    // -----------------------------------------------------------------------

    async fn get_idempotent_result(
        &self,
        key: &str,
    ) -> Result<Option<IdempotentRecord>, RepositoryError> {
        Ok(self.idempotency.get(key).map(|entry| entry.value().clone()))
    }

    async fn save_idempotent_result(
        &self,
        key: &str,
        record: &IdempotentRecord,
    ) -> Result<(), RepositoryError> {
        self.idempotency.insert(key.to_string(), record.clone());
        Ok(())
    }
}
