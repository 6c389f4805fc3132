//! Pause/resume monitor.
//!
//! Brings paused flows back to `Running` when one of their triggers fires:
//!
//! - **Timeout**: `now >= paused_at + timeout` (inclusive). Without
//!   `resume_on_timeout` the pause expires instead and the flow fails.
//! - **Condition**: the paused step's `resume_when` predicate holds.
//! - **Event**: a signed event whose type the pause accepts, whose signature
//!   verifies and which has not expired. The step's event matcher and the
//!   security gate's per-step checks must also pass.
//!
//! Timeouts and conditions are evaluated by `check_once`, which the
//! background loop started by `spawn` calls on a fixed interval. Events are
//! evaluated immediately by `handle_event`. Accepted resumes run
//! concurrently, one task per flow.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waypoint_types::error::EngineError;
use waypoint_types::event::{FlowEvent, FlowEventType, SignedEvent};
use waypoint_types::flow::{FlowInstance, FlowStatus};

use crate::repository::flow::FlowRepository;
use crate::service::security::SecurityGate;

use super::context::FlowExecutionContext;
use super::engine::FlowEngine;
use super::executor::FlowResult;

/// What brought a flow back to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeTrigger {
    Manual,
    Timeout,
    Condition,
    Event,
    /// Re-entry of a run that was interrupted while `Ready` or `Running`.
    Recovery,
}

impl ResumeTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            ResumeTrigger::Manual => "manual",
            ResumeTrigger::Timeout => "timeout",
            ResumeTrigger::Condition => "condition",
            ResumeTrigger::Event => "event",
            ResumeTrigger::Recovery => "recovery",
        }
    }
}

/// Flows touched by one sweep or event delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeSweep {
    pub resumed: Vec<Uuid>,
    /// Pauses whose timeout elapsed without `resume_on_timeout`.
    pub expired: Vec<Uuid>,
    /// Resumes refused by the security gate.
    pub rejected: Vec<Uuid>,
}

impl ResumeSweep {
    pub fn is_empty(&self) -> bool {
        self.resumed.is_empty() && self.expired.is_empty() && self.rejected.is_empty()
    }
}

type Resumes = JoinSet<(Uuid, Result<FlowResult, EngineError>)>;

/// Evaluates resume triggers of paused flows.
pub struct PauseMonitor<R: FlowRepository, S: SecurityGate> {
    engine: FlowEngine<R, S>,
}

impl<R: FlowRepository, S: SecurityGate> Clone for PauseMonitor<R, S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<R, S> PauseMonitor<R, S>
where
    R: FlowRepository + 'static,
    S: SecurityGate + 'static,
{
    pub fn new(engine: FlowEngine<R, S>) -> Self {
        Self { engine }
    }

    /// Evaluate timeout and condition triggers of every paused flow at `now`.
    pub async fn check_once(&self, now: DateTime<Utc>) -> Result<ResumeSweep, EngineError> {
        let repo = self.engine.repo();
        let mut sweep = ResumeSweep::default();
        let mut due: Vec<(FlowInstance, ResumeTrigger)> = Vec::new();
        let mut seen = HashSet::new();

        for flow in repo.get_paused_flows_for_auto_resume().await? {
            let Some(resume) = &flow.active_resume else {
                continue;
            };
            let Some(paused_at) = flow.paused_at else {
                continue;
            };
            if !resume.is_timeout_due(paused_at, now) {
                continue;
            }
            seen.insert(flow.id);
            if resume.resume_on_timeout {
                due.push((flow, ResumeTrigger::Timeout));
            } else if self.expire(flow.id).await {
                sweep.expired.push(flow.id);
            }
        }

        for flow in repo.list_paused_flows().await? {
            if seen.contains(&flow.id) {
                continue;
            }
            let Some(blueprint) = self.engine.blueprint(&flow.flow_type) else {
                continue;
            };
            let Some(step) = blueprint.top_step(flow.current_step_index) else {
                continue;
            };
            let Some(condition) = &step.resume_when else {
                continue;
            };
            let ctx = FlowExecutionContext::from_flow(
                &flow,
                self.engine.services().clone(),
                CancellationToken::new(),
            );
            if condition(&ctx) {
                due.push((flow, ResumeTrigger::Condition));
            }
        }

        let mut resumes = Resumes::new();
        for (flow, trigger) in due {
            let step = flow.current_step_name.clone().unwrap_or_default();
            if !self
                .engine
                .security()
                .can_resume_from_step(&flow, &step, None)
                .await
            {
                self.reject(flow.id, &step, trigger, "security gate refused resume from step")
                    .await;
                sweep.rejected.push(flow.id);
                continue;
            }
            self.spawn_resume(&mut resumes, flow.id, trigger, BTreeMap::new());
        }

        self.collect(resumes, &mut sweep).await;
        if !sweep.is_empty() {
            tracing::info!(
                resumed = sweep.resumed.len(),
                expired = sweep.expired.len(),
                rejected = sweep.rejected.len(),
                "auto-resume sweep"
            );
        }
        Ok(sweep)
    }

    /// Deliver a signed event to every paused flow waiting for it.
    ///
    /// Events with an invalid signature or past the configured TTL are
    /// rejected before any flow is looked at.
    pub async fn handle_event(&self, event: &SignedEvent) -> Result<ResumeSweep, EngineError> {
        let security = self.engine.security();
        if !security.validate_event_signature(event) {
            tracing::warn!(
                event_id = %event.id,
                event_type = event.event_type.as_str(),
                publisher = event.publisher_id.as_str(),
                "rejected event with invalid signature"
            );
            return Err(EngineError::EventRejected("invalid signature".to_string()));
        }
        if event.is_expired(Utc::now(), self.engine.config().event_ttl()) {
            tracing::warn!(
                event_id = %event.id,
                event_type = event.event_type.as_str(),
                timestamp = %event.timestamp,
                "rejected expired event"
            );
            return Err(EngineError::EventRejected("event expired".to_string()));
        }

        let mut sweep = ResumeSweep::default();
        let mut resumes = Resumes::new();

        for flow in self.engine.repo().list_paused_flows().await? {
            let Some(resume) = &flow.active_resume else {
                continue;
            };
            if !resume.accepts_event(&event.event_type) {
                continue;
            }
            if event
                .correlation_id
                .as_ref()
                .is_some_and(|c| *c != flow.correlation_id)
            {
                continue;
            }
            let Some(blueprint) = self.engine.blueprint(&flow.flow_type) else {
                continue;
            };
            let Some(step) = blueprint.top_step(flow.current_step_index) else {
                continue;
            };
            if let Some(matcher) = &step.event_matcher {
                let ctx = FlowExecutionContext::from_flow(
                    &flow,
                    self.engine.services().clone(),
                    CancellationToken::new(),
                );
                if !matcher(&event.payload, &ctx) {
                    continue;
                }
            }

            if !security.can_resume_with_event(&flow, &step.name, event).await {
                self.reject(flow.id, &step.name, ResumeTrigger::Event, "event may not resume this step")
                    .await;
                sweep.rejected.push(flow.id);
                continue;
            }
            if !security
                .validate_event_payload_for_step(&flow, &step.name, event)
                .await
            {
                self.reject(flow.id, &step.name, ResumeTrigger::Event, "event payload refused for step")
                    .await;
                sweep.rejected.push(flow.id);
                continue;
            }

            let mut data = BTreeMap::new();
            data.insert("resume_event".to_string(), event_summary(event));
            self.spawn_resume(&mut resumes, flow.id, ResumeTrigger::Event, data);
        }

        self.collect(resumes, &mut sweep).await;
        tracing::debug!(
            event_id = %event.id,
            event_type = event.event_type.as_str(),
            resumed = sweep.resumed.len(),
            rejected = sweep.rejected.len(),
            "delivered event"
        );
        Ok(sweep)
    }

    /// Run `check_once` every `interval` until `shutdown` is cancelled.
    pub fn spawn(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(interval_secs = interval.as_secs(), "auto-resume monitor started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.check_once(Utc::now()).await {
                            tracing::warn!(error = %e, "auto-resume sweep failed");
                        }
                    }
                }
            }
            tracing::info!("auto-resume monitor stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn spawn_resume(
        &self,
        resumes: &mut Resumes,
        flow_id: Uuid,
        trigger: ResumeTrigger,
        data: BTreeMap<String, Value>,
    ) {
        let engine = self.engine.clone();
        resumes.spawn(async move {
            let result = engine.resume_paused(flow_id, trigger, None, data).await;
            (flow_id, result)
        });
    }

    async fn collect(&self, mut resumes: Resumes, sweep: &mut ResumeSweep) {
        while let Some(joined) = resumes.join_next().await {
            match joined {
                Ok((flow_id, Ok(_))) => sweep.resumed.push(flow_id),
                Ok((flow_id, Err(e))) => {
                    tracing::warn!(flow_id = %flow_id, error = %e, "resume failed");
                }
                Err(e) => tracing::error!(error = %e, "resume task aborted"),
            }
        }
        sweep.resumed.sort();
    }

    /// Expire a pause whose timeout elapsed: the flow fails.
    async fn expire(&self, flow_id: Uuid) -> bool {
        let result = async {
            let _claim = self.engine.runtime().claim(flow_id)?;
            let mut flow = self.engine.checkpoints().reload(flow_id).await?;
            if flow.status != FlowStatus::Paused {
                return Err(EngineError::InvalidTransition {
                    flow_id,
                    from: flow.status,
                    to: FlowStatus::Failed,
                });
            }
            let step = flow.current_step_name.clone();
            self.engine
                .executor()
                .fail(&mut flow, step.as_deref(), "pause timed out".to_string())
                .await
        }
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(flow_id = %flow_id, error = %e, "failed to expire pause");
                false
            }
        }
    }

    async fn reject(&self, flow_id: Uuid, step: &str, trigger: ResumeTrigger, reason: &str) {
        tracing::warn!(flow_id = %flow_id, step, trigger = trigger.as_str(), reason, "resume rejected");
        let event = FlowEvent::new(
            flow_id,
            FlowEventType::ResumeRejected,
            json!({ "step": step, "trigger": trigger.as_str(), "reason": reason }),
        );
        if let Err(e) = self.engine.checkpoints().record_detached(&event).await {
            tracing::warn!(flow_id = %flow_id, error = %e, "failed to record rejected resume");
        }
    }
}

/// Event fields handed to the resumed step under `data["resume_event"]`.
fn event_summary(event: &SignedEvent) -> Value {
    json!({
        "id": event.id,
        "event_type": event.event_type,
        "publisher_id": event.publisher_id,
        "correlation_id": event.correlation_id,
        "timestamp": event.timestamp,
        "payload": event.payload,
    })
}
