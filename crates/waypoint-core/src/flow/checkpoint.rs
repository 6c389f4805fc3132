//! Durable checkpoints for flow runs.
//!
//! Wraps the `FlowRepository` with the side effects that accompany every
//! save: the optimistic version is written back into the in-memory record,
//! the runtime snapshot cache is refreshed, and live observers are notified.
//! Audit events are appended both to the run record and to the repository's
//! event log.

use std::sync::Arc;

use uuid::Uuid;
use waypoint_types::error::EngineError;
use waypoint_types::event::{FlowEvent, FlowNotification};
use waypoint_types::flow::{FlowInstance, StepStatus};

use crate::event::bus::NotificationBus;
use crate::repository::flow::FlowRepository;

use super::runtime::RuntimeFlowStore;

/// Persists flow state and fans out the resulting notifications.
pub struct CheckpointManager<R: FlowRepository> {
    repo: Arc<R>,
    runtime: Arc<RuntimeFlowStore>,
    bus: NotificationBus,
}

impl<R: FlowRepository> CheckpointManager<R> {
    pub fn new(repo: Arc<R>, runtime: Arc<RuntimeFlowStore>, bus: NotificationBus) -> Self {
        Self { repo, runtime, bus }
    }

    pub fn repo(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn runtime(&self) -> &Arc<RuntimeFlowStore> {
        &self.runtime
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Save `flow`, adopting the new version.
    ///
    /// A version mismatch surfaces as `EngineError::ConcurrencyConflict`.
    pub async fn save(&self, flow: &mut FlowInstance) -> Result<(), EngineError> {
        let version = self.repo.save_flow(flow).await.map_err(EngineError::from)?;
        flow.version = version;
        self.runtime.refresh(flow);

        tracing::debug!(
            flow_id = %flow.id,
            status = %flow.status,
            step_index = flow.current_step_index,
            version,
            "checkpointed flow"
        );

        self.bus.publish(FlowNotification::StatusChanged {
            detail: Box::new(flow.detail()),
        });
        Ok(())
    }

    /// Append `event` to the run record and the audit log.
    pub async fn record(&self, flow: &mut FlowInstance, event: FlowEvent) -> Result<(), EngineError> {
        self.repo.save_event(&event).await.map_err(EngineError::from)?;
        flow.events.push(event);
        Ok(())
    }

    pub async fn record_all(
        &self,
        flow: &mut FlowInstance,
        events: impl IntoIterator<Item = FlowEvent>,
    ) -> Result<(), EngineError> {
        for event in events {
            self.record(flow, event).await?;
        }
        Ok(())
    }

    /// Append an audit event for a flow that is not loaded.
    pub async fn record_detached(&self, event: &FlowEvent) -> Result<(), EngineError> {
        self.repo.save_event(event).await.map_err(EngineError::from)
    }

    pub fn step_changed(&self, flow_id: Uuid, step: &str, status: StepStatus) {
        self.bus.publish(FlowNotification::StepChanged {
            flow_id,
            step: step.to_string(),
            status,
        });
    }

    pub fn error(&self, flow_id: Uuid, message: impl Into<String>) {
        self.bus.publish(FlowNotification::Error {
            flow_id,
            message: message.into(),
        });
    }

    /// Reload `flow_id` from the repository, refreshing the runtime cache.
    pub async fn reload(&self, flow_id: Uuid) -> Result<FlowInstance, EngineError> {
        let flow = self
            .repo
            .load_flow(&flow_id)
            .await
            .map_err(EngineError::from)?
            .ok_or(EngineError::NotFound(flow_id))?;
        self.runtime.refresh(&flow);
        Ok(flow)
    }
}
