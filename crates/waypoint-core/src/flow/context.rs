//! Execution context handed to step bodies, predicates and branch factories.
//!
//! The context is rebuilt from the `FlowInstance` whenever the executor
//! (re-)enters a run, so nothing in it needs to be serialisable. Services are
//! looked up by type from an injected [`Services`] container.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waypoint_types::flow::{FlowInstance, StepResult, StepStatus};

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Type-keyed container of shared services available to step bodies.
#[derive(Clone, Default)]
pub struct Services {
    inner: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service`, replacing any previous value of the same type.
    pub fn with<T: Any + Send + Sync>(mut self, service: T) -> Self {
        Arc::make_mut(&mut self.inner).insert(TypeId::of::<T>(), Arc::new(service));
        self
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner
            .get(&TypeId::of::<T>())
            .and_then(|s| Arc::clone(s).downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").field("count", &self.len()).finish()
    }
}

// ---------------------------------------------------------------------------
// BranchItem
// ---------------------------------------------------------------------------

/// Identifies the dynamic branch a context belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchItem {
    pub branch: String,
    /// Position of the item in the selector output.
    pub index: usize,
    /// The selected item (or the branch's source data when it carries one).
    pub item: Value,
}

// ---------------------------------------------------------------------------
// FlowExecutionContext
// ---------------------------------------------------------------------------

/// Per-step view of a running flow.
#[derive(Clone)]
pub struct FlowExecutionContext {
    pub flow_id: Uuid,
    pub flow_type: String,
    pub user_id: String,
    pub correlation_id: String,
    /// Step currently executing, if any.
    pub step_name: Option<String>,
    /// 1-based attempt number of the current step.
    pub attempt: u32,
    /// Set when running inside a dynamic branch.
    pub branch: Option<BranchItem>,
    data: BTreeMap<String, Value>,
    step_statuses: BTreeMap<String, StepStatus>,
    step_results: BTreeMap<String, StepResult>,
    cancellation: CancellationToken,
    services: Services,
}

impl FlowExecutionContext {
    /// Rebuild the context of `flow`.
    pub fn from_flow(flow: &FlowInstance, services: Services, cancellation: CancellationToken) -> Self {
        let mut step_statuses = BTreeMap::new();
        let mut step_results = BTreeMap::new();
        for state in &flow.steps {
            step_statuses.insert(state.name.clone(), state.status);
            if let Some(result) = &state.result {
                step_results.insert(state.name.clone(), result.clone());
            }
        }

        Self {
            flow_id: flow.id,
            flow_type: flow.flow_type.clone(),
            user_id: flow.user_id.clone(),
            correlation_id: flow.correlation_id.clone(),
            step_name: flow.current_step_name.clone(),
            attempt: 0,
            branch: None,
            data: flow.data.clone(),
            step_statuses,
            step_results,
            cancellation,
            services,
        }
    }

    /// Context not attached to any stored run. Useful for evaluating
    /// predicates and handlers in isolation.
    pub fn detached(flow_type: impl Into<String>, user_id: impl Into<String>) -> Self {
        let flow_id = Uuid::now_v7();
        Self {
            flow_id,
            flow_type: flow_type.into(),
            user_id: user_id.into(),
            correlation_id: flow_id.to_string(),
            step_name: None,
            attempt: 0,
            branch: None,
            data: BTreeMap::new(),
            step_statuses: BTreeMap::new(),
            step_results: BTreeMap::new(),
            cancellation: CancellationToken::new(),
            services: Services::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Data bag
    // -----------------------------------------------------------------------

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Deserialize the entry under `key`. Missing or mistyped entries yield `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn merge(&mut self, updates: &BTreeMap<String, Value>) {
        for (k, v) in updates {
            self.data.insert(k.clone(), v.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Step state
    // -----------------------------------------------------------------------

    pub fn step_status(&self, name: &str) -> Option<StepStatus> {
        self.step_statuses.get(name).copied()
    }

    pub fn step_result(&self, name: &str) -> Option<&StepResult> {
        self.step_results.get(name)
    }

    pub fn step_succeeded(&self, name: &str) -> bool {
        self.step_status(name) == Some(StepStatus::Succeeded)
    }

    /// Record a step outcome in this context (sub-steps of branches are not
    /// part of the run record, so they only live here).
    pub fn record_step(&mut self, name: &str, status: StepStatus, result: Option<StepResult>) {
        self.step_statuses.insert(name.to_string(), status);
        match result {
            Some(result) => {
                self.step_results.insert(name.to_string(), result);
            }
            None => {
                self.step_results.remove(name);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation and services
    // -----------------------------------------------------------------------

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.services.get::<T>()
    }

    // -----------------------------------------------------------------------
    // Derivations
    // -----------------------------------------------------------------------

    pub fn with_step(mut self, name: impl Into<String>) -> Self {
        self.step_name = Some(name.into());
        self.attempt = 0;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_branch(mut self, branch: BranchItem) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }
}

impl std::fmt::Debug for FlowExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowExecutionContext")
            .field("flow_id", &self.flow_id)
            .field("flow_type", &self.flow_type)
            .field("step_name", &self.step_name)
            .field("attempt", &self.attempt)
            .field("branch", &self.branch)
            .field("data_keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use waypoint_types::flow::FlowInstance;

    #[derive(Debug, PartialEq)]
    struct Clock(u64);

    fn flow() -> FlowInstance {
        let mut data = BTreeMap::new();
        data.insert("amount".to_string(), json!(120));
        data.insert("currency".to_string(), json!("EUR"));
        let mut flow = FlowInstance::new(
            Uuid::now_v7(),
            "order",
            "alice",
            "corr-1",
            vec!["validate".to_string(), "charge".to_string()],
            data,
        );
        flow.steps[0].status = StepStatus::Succeeded;
        flow.steps[0].result = Some(StepResult::success(Some("ok".into()), None));
        flow
    }

    #[test]
    fn context_mirrors_flow_record() {
        let ctx = FlowExecutionContext::from_flow(&flow(), Services::new(), CancellationToken::new());
        assert_eq!(ctx.get::<i64>("amount"), Some(120));
        assert_eq!(ctx.get_str("currency"), Some("EUR"));
        assert!(ctx.get::<i64>("currency").is_none());
        assert!(ctx.step_succeeded("validate"));
        assert_eq!(ctx.step_status("charge"), Some(StepStatus::Pending));
        assert_eq!(
            ctx.step_result("validate").and_then(|r| r.message.as_deref()),
            Some("ok")
        );
    }

    #[test]
    fn services_are_looked_up_by_type() {
        let services = Services::new().with(Clock(7)).with("label".to_string());
        assert_eq!(services.len(), 2);
        assert_eq!(services.get::<Clock>().as_deref(), Some(&Clock(7)));
        assert!(services.get::<u8>().is_none());
    }

    #[test]
    fn cancellation_is_shared() {
        let token = CancellationToken::new();
        let ctx = FlowExecutionContext::from_flow(&flow(), Services::new(), token.clone());
        let copy = ctx.clone().with_step("charge");
        token.cancel();
        assert!(copy.is_cancelled());
    }

    #[test]
    fn record_step_updates_status_and_result() {
        let mut ctx = FlowExecutionContext::detached("order", "alice");
        ctx.record_step("inner", StepStatus::Failed, Some(StepResult::failure("nope")));
        assert_eq!(ctx.step_status("inner"), Some(StepStatus::Failed));
        ctx.record_step("inner", StepStatus::Skipped, None);
        assert!(ctx.step_result("inner").is_none());
    }
}
