//! In-process runtime store.
//!
//! Tracks which flows are executing in this process (with their
//! cancellation tokens) and caches the last persisted snapshot of every
//! non-terminal flow. The repository stays the source of truth: the cache is
//! refreshed after every save and evicted when a flow reaches a terminal
//! status. One store is created per engine and torn down by `shutdown`.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waypoint_types::error::EngineError;
use waypoint_types::flow::FlowInstance;

#[derive(Debug, Default)]
pub struct RuntimeFlowStore {
    active: DashMap<Uuid, CancellationToken>,
    snapshots: DashMap<Uuid, FlowInstance>,
    shutdown: CancellationToken,
}

/// Exclusive claim on a flow id. Released on drop.
#[derive(Debug)]
pub struct RunClaim {
    store: Arc<RuntimeFlowStore>,
    flow_id: Uuid,
    token: CancellationToken,
}

impl RunClaim {
    pub fn flow_id(&self) -> Uuid {
        self.flow_id
    }

    /// Token cancelled by `RuntimeFlowStore::cancel` or engine shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.store.active.remove(&self.flow_id);
    }
}

impl RuntimeFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `flow_id` as executing in this process.
    ///
    /// Fails with `ConcurrencyConflict` if the flow is already executing or
    /// the store has been shut down.
    pub fn claim(self: &Arc<Self>, flow_id: Uuid) -> Result<RunClaim, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ConcurrencyConflict(flow_id));
        }
        match self.active.entry(flow_id) {
            Entry::Occupied(_) => Err(EngineError::ConcurrencyConflict(flow_id)),
            Entry::Vacant(slot) => {
                let token = self.shutdown.child_token();
                slot.insert(token.clone());
                Ok(RunClaim {
                    store: Arc::clone(self),
                    flow_id,
                    token,
                })
            }
        }
    }

    pub fn is_active(&self, flow_id: &Uuid) -> bool {
        self.active.contains_key(flow_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Signal cancellation to an executing flow. Returns `false` if the flow
    /// is not executing here.
    pub fn cancel(&self, flow_id: &Uuid) -> bool {
        match self.active.get(flow_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Record the latest persisted state of `flow`.
    pub fn refresh(&self, flow: &FlowInstance) {
        if flow.status.is_terminal() {
            self.snapshots.remove(&flow.id);
        } else {
            self.snapshots.insert(flow.id, flow.clone());
        }
    }

    pub fn snapshot(&self, flow_id: &Uuid) -> Option<FlowInstance> {
        self.snapshots.get(flow_id).map(|f| f.clone())
    }

    pub fn invalidate(&self, flow_id: &Uuid) {
        self.snapshots.remove(flow_id);
    }

    /// Token cancelled when the store shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel every executing flow and drop all cached snapshots.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.snapshots.clear();
        tracing::info!(active = self.active.len(), "runtime flow store shut down");
    }
}
