//! `FlowEngine` facade.
//!
//! The single entry point callers use: register blueprints, start, resume,
//! fire, trigger, cancel, query and publish events. Every operation consults
//! the `SecurityGate` before it touches a flow. Execution itself is delegated
//! to the `FlowExecutor`; the `RuntimeFlowStore` guarantees a flow id is
//! driven by at most one task in this process, and the repository's version
//! check covers everything beyond it.
//!
//! The engine is cheap to clone (one `Arc`), so step bodies can reach it
//! through `Services` to trigger child flows.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;
use waypoint_types::config::EngineConfig;
use waypoint_types::error::EngineError;
use waypoint_types::event::{FlowEvent, FlowEventType, FlowNotification, SignedEvent};
use waypoint_types::flow::{FlowInstance, FlowStatus, FlowSummary};
use waypoint_types::query::{FlowFilter, Page};

use crate::event::bus::NotificationBus;
use crate::repository::flow::FlowRepository;
use crate::service::hash::ContentHasher;
use crate::service::security::SecurityGate;
use crate::service::validation::{DataValidator, ValidationReport};

use super::blueprint::{BlueprintReport, FlowBlueprint, FlowRegistry};
use super::checkpoint::CheckpointManager;
use super::context::{FlowExecutionContext, Services};
use super::executor::{FlowExecutor, FlowResult};
use super::middleware::MiddlewarePipeline;
use super::pause::{PauseMonitor, ResumeSweep, ResumeTrigger};
use super::runtime::RuntimeFlowStore;
use super::step_executor::StepExecutor;

// ---------------------------------------------------------------------------
// Requests and handles
// ---------------------------------------------------------------------------

/// Parameters of a new run.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub flow_type: String,
    pub user_id: String,
    pub data: BTreeMap<String, Value>,
    /// Defaults to the new flow's id.
    pub correlation_id: Option<String>,
    pub parent_flow_id: Option<Uuid>,
}

impl StartRequest {
    pub fn new(flow_type: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            flow_type: flow_type.into(),
            user_id: user_id.into(),
            data: BTreeMap::new(),
            correlation_id: None,
            parent_flow_id: None,
        }
    }

    pub fn data(mut self, data: BTreeMap<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn parent(mut self, parent_flow_id: Uuid) -> Self {
        self.parent_flow_id = Some(parent_flow_id);
        self
    }
}

/// Handle to a fire-and-forget start.
#[derive(Debug)]
pub struct FireHandle {
    pub flow_id: Uuid,
    handle: JoinHandle<Option<FlowResult>>,
}

impl FireHandle {
    /// Wait for the background start. `None` if it failed (the failure is in
    /// the flow's audit log).
    pub async fn join(self) -> Option<FlowResult> {
        self.handle.await.ok().flatten()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// A signed event published through the engine and what it resumed.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub event: SignedEvent,
    pub sweep: ResumeSweep,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct FlowEngineBuilder<R: FlowRepository, S: SecurityGate> {
    repo: Arc<R>,
    security: Arc<S>,
    validator: Arc<dyn DataValidator>,
    hasher: Arc<dyn ContentHasher>,
    config: EngineConfig,
    middleware: MiddlewarePipeline,
    services: Services,
}

impl<R, S> FlowEngineBuilder<R, S>
where
    R: FlowRepository + 'static,
    S: SecurityGate + 'static,
{
    pub fn new(
        repo: Arc<R>,
        security: Arc<S>,
        validator: Arc<dyn DataValidator>,
        hasher: Arc<dyn ContentHasher>,
    ) -> Self {
        Self {
            repo,
            security,
            validator,
            hasher,
            config: EngineConfig::default(),
            middleware: MiddlewarePipeline::standard(),
            services: Services::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the standard middleware pipeline.
    pub fn middleware(mut self, middleware: MiddlewarePipeline) -> Self {
        self.middleware = middleware;
        self
    }

    /// Services handed to step bodies through their context.
    pub fn services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    pub fn build(self) -> FlowEngine<R, S> {
        let runtime = Arc::new(RuntimeFlowStore::new());
        let bus = NotificationBus::new(self.config.notification_capacity);
        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&self.repo),
            Arc::clone(&runtime),
            bus.clone(),
        ));
        let steps = StepExecutor::new(Arc::clone(&self.repo), Arc::new(self.middleware));
        let executor = FlowExecutor::new(
            steps,
            Arc::clone(&checkpoints),
            self.services.clone(),
            self.config.max_jumps,
        );

        FlowEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                registry: FlowRegistry::new(),
                repo: self.repo,
                security: self.security,
                validator: self.validator,
                hasher: self.hasher,
                services: self.services,
                executor,
                checkpoints,
                runtime,
                bus,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// FlowEngine
// ---------------------------------------------------------------------------

struct EngineInner<R: FlowRepository, S: SecurityGate> {
    config: EngineConfig,
    registry: FlowRegistry,
    repo: Arc<R>,
    security: Arc<S>,
    validator: Arc<dyn DataValidator>,
    hasher: Arc<dyn ContentHasher>,
    services: Services,
    executor: FlowExecutor<R>,
    checkpoints: Arc<CheckpointManager<R>>,
    runtime: Arc<RuntimeFlowStore>,
    bus: NotificationBus,
}

/// The workflow engine.
pub struct FlowEngine<R: FlowRepository, S: SecurityGate> {
    inner: Arc<EngineInner<R, S>>,
}

impl<R: FlowRepository, S: SecurityGate> Clone for FlowEngine<R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, S> FlowEngine<R, S>
where
    R: FlowRepository + 'static,
    S: SecurityGate + 'static,
{
    pub fn builder(
        repo: Arc<R>,
        security: Arc<S>,
        validator: Arc<dyn DataValidator>,
        hasher: Arc<dyn ContentHasher>,
    ) -> FlowEngineBuilder<R, S> {
        FlowEngineBuilder::new(repo, security, validator, hasher)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.inner.registry
    }

    pub fn runtime(&self) -> &Arc<RuntimeFlowStore> {
        &self.inner.runtime
    }

    pub(crate) fn repo(&self) -> &Arc<R> {
        &self.inner.repo
    }

    pub(crate) fn security(&self) -> &Arc<S> {
        &self.inner.security
    }

    pub(crate) fn services(&self) -> &Services {
        &self.inner.services
    }

    pub(crate) fn checkpoints(&self) -> &Arc<CheckpointManager<R>> {
        &self.inner.checkpoints
    }

    pub(crate) fn executor(&self) -> &FlowExecutor<R> {
        &self.inner.executor
    }

    pub(crate) fn blueprint(&self, flow_type: &str) -> Option<Arc<FlowBlueprint>> {
        self.inner.registry.get(flow_type)
    }

    fn require_blueprint(&self, flow_type: &str) -> Result<Arc<FlowBlueprint>, EngineError> {
        self.blueprint(flow_type)
            .ok_or_else(|| EngineError::UnknownFlowType(flow_type.to_string()))
    }

    /// Validate and register a flow type.
    pub fn register(&self, blueprint: FlowBlueprint) -> Result<BlueprintReport, EngineError> {
        self.inner
            .registry
            .register(blueprint, self.inner.config.strict_branching)
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Start a new run and drive it until it pauses or finishes.
    pub async fn start(
        &self,
        flow_type: &str,
        data: BTreeMap<String, Value>,
        user_id: &str,
        correlation_id: Option<&str>,
    ) -> Result<FlowResult, EngineError> {
        let mut request = StartRequest::new(flow_type, user_id).data(data);
        request.correlation_id = correlation_id.map(str::to_string);
        self.start_with_id(Uuid::now_v7(), request).await
    }

    /// Start a run under a caller-chosen id.
    pub async fn start_with_id(
        &self,
        flow_id: Uuid,
        request: StartRequest,
    ) -> Result<FlowResult, EngineError> {
        let blueprint = self.require_blueprint(&request.flow_type)?;

        let report = self.validate_start(&blueprint, &request);
        if !report.is_valid() {
            tracing::warn!(
                flow_type = request.flow_type.as_str(),
                user_id = request.user_id.as_str(),
                errors = ?report.errors,
                "rejected initial data"
            );
            return Err(EngineError::Validation(report.errors));
        }

        if !self
            .inner
            .security
            .can_start_flow(&request.user_id, &request.flow_type, &request.data)
            .await
        {
            tracing::warn!(
                flow_type = request.flow_type.as_str(),
                user_id = request.user_id.as_str(),
                "start refused by security gate"
            );
            return Err(EngineError::Unauthorized(format!(
                "user '{}' may not start '{}'",
                request.user_id, request.flow_type
            )));
        }

        let data_hash = self.hash_data(&request.data);
        let correlation_id = request
            .correlation_id
            .unwrap_or_else(|| flow_id.to_string());
        let mut flow = FlowInstance::new(
            flow_id,
            request.flow_type.as_str(),
            request.user_id.as_str(),
            correlation_id.as_str(),
            blueprint.step_names(),
            request.data,
        );
        flow.parent_flow_id = request.parent_flow_id;

        let checkpoints = &self.inner.checkpoints;
        let created = FlowEvent::new(
            flow_id,
            FlowEventType::Created,
            json!({
                "flow_type": flow.flow_type,
                "correlation_id": flow.correlation_id,
                "parent_flow_id": flow.parent_flow_id,
                "data_hash": data_hash,
            }),
        )
        .by(flow.user_id.as_str());
        checkpoints.record(&mut flow, created).await?;
        checkpoints.save(&mut flow).await?;
        flow.transition(FlowStatus::Ready)?;
        checkpoints.save(&mut flow).await?;

        tracing::info!(
            flow_id = %flow_id,
            flow_type = flow.flow_type.as_str(),
            user_id = flow.user_id.as_str(),
            correlation_id = flow.correlation_id.as_str(),
            "flow started"
        );

        let claim = self.inner.runtime.claim(flow_id)?;
        self.inner
            .executor
            .execute(&blueprint, &mut flow, &claim.token())
            .await
    }

    fn validate_start(&self, blueprint: &FlowBlueprint, request: &StartRequest) -> ValidationReport {
        let mut report = ValidationReport::ok();
        for (key, data_type) in blueprint.required_input() {
            match request.data.get(key) {
                None => report.push(format!("initial data '{key}' is missing")),
                Some(value) if !data_type.matches(value) => {
                    report.push(format!("initial data '{key}' is not of type {data_type}"));
                }
                Some(_) => {}
            }
        }

        let size = serde_json::to_vec(&request.data).map_or(0, |bytes| bytes.len());
        if size > self.inner.config.max_initial_data_bytes {
            report.push(format!(
                "initial data is {size} bytes; the limit is {}",
                self.inner.config.max_initial_data_bytes
            ));
        }

        report.merge(
            self.inner
                .validator
                .validate_initial_data(&request.flow_type, &request.data),
        );
        report
    }

    fn hash_data(&self, data: &BTreeMap<String, Value>) -> String {
        let canonical = serde_json::to_string(data).unwrap_or_default();
        self.inner.hasher.compute_hash(&canonical)
    }

    /// Start a run in the background. Failures never reach the caller: they
    /// are recorded as `FireFailed` audit events and error notifications.
    pub fn fire(
        &self,
        flow_type: &str,
        data: BTreeMap<String, Value>,
        user_id: &str,
    ) -> FireHandle {
        let flow_id = Uuid::now_v7();
        let request = StartRequest::new(flow_type, user_id).data(data);
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let flow_type = request.flow_type.clone();
            let user_id = request.user_id.clone();
            match engine.start_with_id(flow_id, request).await {
                Ok(result) => Some(result),
                Err(e) => {
                    engine.record_fire_failure(flow_id, &flow_type, &user_id, &e).await;
                    None
                }
            }
        });
        FireHandle { flow_id, handle }
    }

    async fn record_fire_failure(&self, flow_id: Uuid, flow_type: &str, user_id: &str, error: &EngineError) {
        tracing::error!(
            flow_id = %flow_id,
            flow_type,
            user_id,
            error = %error,
            "fire-and-forget start failed"
        );
        let event = FlowEvent::new(
            flow_id,
            FlowEventType::FireFailed,
            json!({ "flow_type": flow_type, "code": error.code(), "error": error.to_string() }),
        )
        .by(user_id);
        if let Err(e) = self.inner.checkpoints.record_detached(&event).await {
            tracing::warn!(flow_id = %flow_id, error = %e, "failed to record fire failure");
        }
        self.inner.checkpoints.error(flow_id, error.to_string());
    }

    /// Start a child flow from inside a running step.
    ///
    /// The child inherits the parent's user; its correlation id is
    /// `"{parent_correlation}:triggered:{child_type}"`.
    pub async fn trigger(
        &self,
        parent: &FlowExecutionContext,
        child_type: &str,
        data: BTreeMap<String, Value>,
    ) -> Result<FlowResult, EngineError> {
        let child_id = Uuid::now_v7();
        let correlation_id = format!("{}:triggered:{child_type}", parent.correlation_id);
        let request = StartRequest::new(child_type, parent.user_id.as_str())
            .data(data)
            .correlation(correlation_id.as_str())
            .parent(parent.flow_id);

        let event = FlowEvent::new(
            parent.flow_id,
            FlowEventType::ChildTriggered,
            json!({
                "child_flow_id": child_id,
                "child_type": child_type,
                "correlation_id": correlation_id,
                "step": parent.step_name,
            }),
        )
        .by(parent.user_id.as_str());
        self.inner.checkpoints.record_detached(&event).await?;

        tracing::info!(
            parent_flow_id = %parent.flow_id,
            child_flow_id = %child_id,
            child_type,
            "triggering child flow"
        );
        self.start_with_id(child_id, request).await
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Resume `flow_id` as the system (no user).
    ///
    /// Paused runs pass their pause gate; runs left `Ready` or `Running` by
    /// an interrupted process are re-entered at their saved step.
    pub async fn resume(&self, flow_id: Uuid) -> Result<FlowResult, EngineError> {
        let flow = self.load(flow_id).await?;
        let step = flow.current_step_name.clone().unwrap_or_default();
        if !self
            .inner
            .security
            .can_resume_from_step(&flow, &step, None)
            .await
        {
            return Err(EngineError::Unauthorized(format!(
                "flow {flow_id} may not be resumed from step '{step}'"
            )));
        }
        self.resume_loaded(flow, ResumeTrigger::Manual, None).await
    }

    /// Resume `flow_id` on behalf of `user_id`.
    pub async fn resume_as(&self, flow_id: Uuid, user_id: &str) -> Result<FlowResult, EngineError> {
        let flow = self.load(flow_id).await?;
        let security = &self.inner.security;
        let step = flow.current_step_name.clone().unwrap_or_default();

        let manual_allowed = flow.active_resume.as_ref().is_none_or(|r| r.allow_manual);
        if !manual_allowed {
            return Err(EngineError::Unauthorized(format!(
                "flow {flow_id} does not accept manual resume"
            )));
        }
        if !security.can_resume_flow(&flow, user_id).await
            || !security.can_resume_from_step(&flow, &step, Some(user_id)).await
        {
            tracing::warn!(flow_id = %flow_id, user_id, step = step.as_str(), "resume refused by security gate");
            return Err(EngineError::Unauthorized(format!(
                "user '{user_id}' may not resume flow {flow_id}"
            )));
        }
        self.resume_loaded(flow, ResumeTrigger::Manual, Some(user_id)).await
    }

    async fn resume_loaded(
        &self,
        flow: FlowInstance,
        trigger: ResumeTrigger,
        user_id: Option<&str>,
    ) -> Result<FlowResult, EngineError> {
        match flow.status {
            FlowStatus::Paused => {
                self.resume_paused(flow.id, trigger, user_id, BTreeMap::new())
                    .await
            }
            FlowStatus::Ready | FlowStatus::Running => self.recover(flow.id).await,
            status => Err(EngineError::InvalidTransition {
                flow_id: flow.id,
                from: status,
                to: FlowStatus::Running,
            }),
        }
    }

    /// Clear the pause gate of a paused run and re-enter the executor.
    ///
    /// `data` is merged into the run's data bag before re-entry.
    pub(crate) async fn resume_paused(
        &self,
        flow_id: Uuid,
        trigger: ResumeTrigger,
        user_id: Option<&str>,
        data: BTreeMap<String, Value>,
    ) -> Result<FlowResult, EngineError> {
        let claim = self.inner.runtime.claim(flow_id)?;
        let checkpoints = &self.inner.checkpoints;
        let mut flow = checkpoints.reload(flow_id).await?;
        if flow.status != FlowStatus::Paused {
            return Err(EngineError::InvalidTransition {
                flow_id,
                from: flow.status,
                to: FlowStatus::Running,
            });
        }
        let blueprint = self.require_blueprint(&flow.flow_type)?;

        flow.data.extend(data);
        flow.resume_token = Some(flow.current_step_index);
        let mut event = FlowEvent::new(
            flow_id,
            FlowEventType::Resumed,
            json!({ "step": flow.current_step_name, "trigger": trigger.as_str() }),
        );
        if let Some(user_id) = user_id {
            event = event.by(user_id);
        }
        checkpoints.record(&mut flow, event).await?;

        tracing::info!(
            flow_id = %flow_id,
            step = flow.current_step_name.as_deref(),
            trigger = trigger.as_str(),
            "flow resumed"
        );
        self.inner
            .executor
            .execute(&blueprint, &mut flow, &claim.token())
            .await
    }

    async fn recover(&self, flow_id: Uuid) -> Result<FlowResult, EngineError> {
        let claim = self.inner.runtime.claim(flow_id)?;
        let mut flow = self.inner.checkpoints.reload(flow_id).await?;
        let blueprint = self.require_blueprint(&flow.flow_type)?;
        let event = FlowEvent::new(
            flow_id,
            FlowEventType::Resumed,
            json!({ "step": flow.current_step_name, "trigger": ResumeTrigger::Recovery.as_str() }),
        );
        self.inner.checkpoints.record(&mut flow, event).await?;

        tracing::info!(
            flow_id = %flow_id,
            step_index = flow.current_step_index,
            "recovering interrupted flow"
        );
        self.inner
            .executor
            .execute(&blueprint, &mut flow, &claim.token())
            .await
    }

    // -----------------------------------------------------------------------
    // Cancel and reads
    // -----------------------------------------------------------------------

    /// Cancel a run. Cooperative: an executing step finishes, the run stops
    /// at the next step boundary. Returns `false` if the run was already
    /// terminal.
    pub async fn cancel(&self, flow_id: Uuid, user_id: &str, reason: &str) -> Result<bool, EngineError> {
        let flow = self.load(flow_id).await?;
        if !self.inner.security.can_cancel_flow(&flow, user_id).await {
            tracing::warn!(flow_id = %flow_id, user_id, "cancel refused by security gate");
            return Err(EngineError::Unauthorized(format!(
                "user '{user_id}' may not cancel flow {flow_id}"
            )));
        }
        if flow.status.is_terminal() {
            return Ok(false);
        }

        let cancelled = self.inner.repo.cancel_flow(&flow_id, reason).await?;
        if !cancelled {
            return Ok(false);
        }

        let event = FlowEvent::new(flow_id, FlowEventType::Cancelled, json!({ "reason": reason }))
            .by(user_id);
        self.inner.checkpoints.record_detached(&event).await?;
        let signalled = self.inner.runtime.cancel(&flow_id);
        self.inner.runtime.invalidate(&flow_id);

        if let Some(stored) = self.inner.repo.load_flow(&flow_id).await? {
            self.inner.bus.publish(FlowNotification::StatusChanged {
                detail: Box::new(stored.detail()),
            });
        }

        tracing::info!(flow_id = %flow_id, user_id, reason, executing = signalled, "flow cancelled");
        Ok(true)
    }

    async fn load(&self, flow_id: Uuid) -> Result<FlowInstance, EngineError> {
        if let Some(snapshot) = self.inner.runtime.snapshot(&flow_id) {
            return Ok(snapshot);
        }
        self.inner
            .repo
            .load_flow(&flow_id)
            .await?
            .ok_or(EngineError::NotFound(flow_id))
    }

    async fn load_for(&self, flow_id: Uuid, user_id: &str) -> Result<FlowInstance, EngineError> {
        let flow = self.load(flow_id).await?;
        if !self.inner.security.can_access_flow(&flow, user_id).await {
            return Err(EngineError::Unauthorized(format!(
                "user '{user_id}' may not access flow {flow_id}"
            )));
        }
        Ok(flow)
    }

    pub async fn get(&self, flow_id: Uuid, user_id: &str) -> Result<FlowInstance, EngineError> {
        self.load_for(flow_id, user_id).await
    }

    pub async fn status(&self, flow_id: Uuid, user_id: &str) -> Result<FlowStatus, EngineError> {
        Ok(self.load_for(flow_id, user_id).await?.status)
    }

    /// Audit log of a run, oldest first.
    pub async fn events(&self, flow_id: Uuid, user_id: &str) -> Result<Vec<FlowEvent>, EngineError> {
        self.load_for(flow_id, user_id).await?;
        Ok(self.inner.repo.get_events(&flow_id).await?)
    }

    /// List runs visible to `user_id`.
    pub async fn query(&self, filter: FlowFilter, user_id: &str) -> Result<Page<FlowSummary>, EngineError> {
        let mut filter = self.inner.security.filter_query(filter, user_id);
        filter.limit = Some(self.inner.config.page_size(filter.limit));
        Ok(self.inner.repo.query_flows(&filter).await?)
    }

    /// Delete terminal runs older than the configured retention.
    pub async fn cleanup_completed(&self) -> Result<usize, EngineError> {
        let cutoff = Utc::now() - self.inner.config.retention();
        let removed = self.inner.repo.cleanup_completed(cutoff).await?;
        tracing::info!(removed, cutoff = %cutoff, "cleaned up terminal flows");
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Sign, broadcast and deliver an event to waiting paused flows.
    pub async fn publish_event(
        &self,
        event_type: &str,
        payload: Value,
        published_by: &str,
        correlation_id: Option<&str>,
    ) -> Result<PublishedEvent, EngineError> {
        let event = self.inner.security.sign_event(
            event_type,
            payload,
            published_by,
            correlation_id.map(str::to_string),
        )?;
        let sweep = self.receive_event(&event).await?;
        Ok(PublishedEvent { event, sweep })
    }

    /// Deliver an externally signed event.
    pub async fn receive_event(&self, event: &SignedEvent) -> Result<ResumeSweep, EngineError> {
        let sweep = self.pause_monitor().handle_event(event).await?;
        self.inner.bus.publish(FlowNotification::EventPublished {
            event_id: event.id,
            event_type: event.event_type.clone(),
            correlation_id: event.correlation_id.clone(),
        });
        Ok(sweep)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn pause_monitor(&self) -> PauseMonitor<R, S> {
        PauseMonitor::new(self.clone())
    }

    /// Start the periodic auto-resume sweep; it stops on `shutdown`.
    pub fn spawn_auto_resume(&self) -> JoinHandle<()> {
        self.pause_monitor().spawn(
            self.inner.config.auto_resume_interval(),
            self.inner.runtime.shutdown_token(),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowNotification> {
        self.inner.bus.subscribe()
    }

    /// Signal every executing run to stop and tear down the runtime store.
    pub fn shutdown(&self) {
        tracing::info!(active = self.inner.runtime.active_count(), "shutting down flow engine");
        self.inner.runtime.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use waypoint_types::flow::DataType;

    use crate::flow::blueprint::{FlowBlueprintBuilder, FlowStep};
    use crate::flow::handler::StepOutput;
    use crate::flow::step_executor::tests::CacheOnlyRepo;
    use crate::service::validation::AcceptAll;

    struct Gate {
        allow_start: bool,
    }

    impl SecurityGate for Gate {
        async fn can_start_flow(&self, _u: &str, _t: &str, _d: &BTreeMap<String, Value>) -> bool {
            self.allow_start
        }
        async fn can_access_flow(&self, flow: &FlowInstance, user_id: &str) -> bool {
            flow.user_id == user_id
        }
        async fn can_cancel_flow(&self, flow: &FlowInstance, user_id: &str) -> bool {
            flow.user_id == user_id
        }
        async fn can_resume_flow(&self, flow: &FlowInstance, user_id: &str) -> bool {
            flow.user_id == user_id
        }
        async fn can_resume_from_step(&self, _f: &FlowInstance, _s: &str, _u: Option<&str>) -> bool {
            true
        }
        async fn can_resume_with_event(&self, _f: &FlowInstance, _s: &str, _e: &SignedEvent) -> bool {
            true
        }
        async fn validate_event_payload_for_step(&self, _f: &FlowInstance, _s: &str, _e: &SignedEvent) -> bool {
            true
        }
        fn filter_query(&self, filter: FlowFilter, user_id: &str) -> FlowFilter {
            filter.user(user_id)
        }
        fn sign_event(
            &self,
            _event_type: &str,
            _payload: Value,
            _publisher_id: &str,
            _correlation_id: Option<String>,
        ) -> Result<SignedEvent, EngineError> {
            Err(EngineError::EventRejected("no signing keys".to_string()))
        }
        fn validate_event_signature(&self, _event: &SignedEvent) -> bool {
            false
        }
    }

    struct LenHasher;

    impl ContentHasher for LenHasher {
        fn compute_hash(&self, content: &str) -> String {
            format!("len:{}", content.len())
        }
    }

    fn engine(allow_start: bool) -> FlowEngine<CacheOnlyRepo, Gate> {
        FlowEngineBuilder::new(
            Arc::new(CacheOnlyRepo::default()),
            Arc::new(Gate { allow_start }),
            Arc::new(AcceptAll),
            Arc::new(LenHasher),
        )
        .build()
    }

    fn counting_blueprint(calls: Arc<AtomicU32>) -> FlowBlueprint {
        FlowBlueprintBuilder::new("order")
            .requires("amount", DataType::Integer)
            .step(FlowStep::from_fn("charge", move |_ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(StepOutput::new()) }
            }))
            .build()
    }

    #[tokio::test]
    async fn start_runs_to_completion_and_hashes_initial_data() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine(true);
        engine.register(counting_blueprint(Arc::clone(&calls))).unwrap();

        let mut data = BTreeMap::new();
        data.insert("amount".to_string(), json!(42));
        let result = engine.start("order", data, "alice", Some("order-7")).await.unwrap();

        assert!(result.is_completed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.flow.correlation_id, "order-7");
        let created = &result.flow.events[0];
        assert_eq!(created.event_type, FlowEventType::Created);
        assert_eq!(created.payload["data_hash"], json!("len:13"));
        assert!(created.payload.get("amount").is_none());
        assert!(!engine.runtime().is_active(&result.flow_id));
    }

    #[tokio::test]
    async fn invalid_initial_data_is_rejected_before_anything_runs() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine(true);
        engine.register(counting_blueprint(Arc::clone(&calls))).unwrap();

        let mut data = BTreeMap::new();
        data.insert("amount".to_string(), json!("lots"));
        let err = engine.start("order", data, "alice", None).await.unwrap_err();

        assert!(matches!(err, EngineError::Validation(ref errors) if errors[0].contains("not of type integer")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unauthorized_start_is_refused() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine(false);
        engine.register(counting_blueprint(Arc::clone(&calls))).unwrap();

        let mut data = BTreeMap::new();
        data.insert("amount".to_string(), json!(1));
        let err = engine.start("order", data, "mallory", None).await.unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_flow_type_is_reported() {
        let err = engine(true)
            .start("nope", BTreeMap::new(), "alice", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownFlowType(ref t) if t == "nope"));
    }

    #[tokio::test]
    async fn unsigned_publish_is_rejected() {
        let err = engine(true)
            .publish_event("kyc.approved", json!({}), "kyc", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EventRejected(_)));
    }
}
