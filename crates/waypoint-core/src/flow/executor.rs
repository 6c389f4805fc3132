//! Flow executor: the walk over a run's top-level steps.
//!
//! Steps run in declaration order from `current_step_index`. Consecutive steps
//! flagged `can_run_in_parallel` that do not depend on each other (and carry
//! no pause gate or jump) form a group that runs concurrently on a `JoinSet`;
//! their outcomes are applied in index order.
//!
//! # Per-step sequence
//!
//! 1. Cancellation check (cooperative, at every step boundary).
//! 2. Pause gate, unless a resume already cleared it for this index.
//! 3. Dependencies must all be `Succeeded`, else the step is `Skipped`.
//! 4. The step condition must hold, else the step is `Skipped`.
//! 5. `StepExecutor::execute`, then the outcome is applied to the run record.
//!    Critical steps are checkpointed immediately.
//! 6. Failure fails the run unless the step allows failure.
//! 7. A jump (static or from the step output) redirects the pointer, bounded
//!    by `max_jumps`.
//!
//! The run record is always checkpointed on pause, completion and failure.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waypoint_types::error::EngineError;
use waypoint_types::event::{FlowEvent, FlowEventType};
use waypoint_types::flow::{FlowInstance, FlowStatus, StepStatus};

use crate::repository::flow::FlowRepository;

use super::blueprint::{FlowBlueprint, FlowStep};
use super::checkpoint::CheckpointManager;
use super::context::{FlowExecutionContext, Services};
use super::handler::StepError;
use super::step_executor::{StepExecution, StepExecutor, outcome_event, skipped_event};

// ---------------------------------------------------------------------------
// FlowResult
// ---------------------------------------------------------------------------

/// Where a run stopped and why.
#[derive(Debug, Clone)]
pub struct FlowResult {
    pub flow_id: Uuid,
    pub status: FlowStatus,
    /// `last_error` of the run, if it failed.
    pub error: Option<String>,
    pub flow: FlowInstance,
}

impl FlowResult {
    pub fn of(flow: &FlowInstance) -> Self {
        Self {
            flow_id: flow.id,
            status: flow.status,
            error: flow.last_error.clone(),
            flow: flow.clone(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == FlowStatus::Completed
    }

    pub fn is_paused(&self) -> bool {
        self.status == FlowStatus::Paused
    }
}

/// What the walk does after a step resolved.
enum Next {
    Continue,
    Stop(FlowResult),
}

// ---------------------------------------------------------------------------
// FlowExecutor
// ---------------------------------------------------------------------------

pub struct FlowExecutor<R: FlowRepository> {
    steps: StepExecutor<R>,
    checkpoints: Arc<CheckpointManager<R>>,
    services: Services,
    max_jumps: u32,
}

impl<R: FlowRepository> Clone for FlowExecutor<R> {
    fn clone(&self) -> Self {
        Self {
            steps: self.steps.clone(),
            checkpoints: Arc::clone(&self.checkpoints),
            services: self.services.clone(),
            max_jumps: self.max_jumps,
        }
    }
}

impl<R: FlowRepository + 'static> FlowExecutor<R> {
    pub fn new(
        steps: StepExecutor<R>,
        checkpoints: Arc<CheckpointManager<R>>,
        services: Services,
        max_jumps: u32,
    ) -> Self {
        Self {
            steps,
            checkpoints,
            services,
            max_jumps,
        }
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager<R>> {
        &self.checkpoints
    }

    /// Drive `flow` from its current step until it pauses, completes, fails
    /// or is cancelled.
    ///
    /// A `Ready` or `Paused` run is moved to `Running` and checkpointed
    /// first. Step failures are reported through the returned `FlowResult`;
    /// `Err` is reserved for persistence and concurrency failures.
    pub async fn execute(
        &self,
        blueprint: &Arc<FlowBlueprint>,
        flow: &mut FlowInstance,
        token: &CancellationToken,
    ) -> Result<FlowResult, EngineError> {
        if flow.status.is_terminal() {
            return Ok(FlowResult::of(flow));
        }

        let outcome = self.run(blueprint, flow, token).await;
        match outcome {
            // A cancel can bump the stored version before the run token fires.
            Err(EngineError::ConcurrencyConflict(id)) => {
                let stored = self.checkpoints.reload(flow.id).await?;
                if stored.status == FlowStatus::Cancelled || token.is_cancelled() {
                    self.interrupted(flow).await
                } else {
                    Err(EngineError::ConcurrencyConflict(id))
                }
            }
            other => other,
        }
    }

    async fn run(
        &self,
        blueprint: &Arc<FlowBlueprint>,
        flow: &mut FlowInstance,
        token: &CancellationToken,
    ) -> Result<FlowResult, EngineError> {
        if flow.status != FlowStatus::Running {
            flow.transition(FlowStatus::Running)?;
            flow.active_resume = None;
            self.checkpoints.save(flow).await?;
        }

        tracing::info!(
            flow_id = %flow.id,
            flow_type = flow.flow_type.as_str(),
            step_index = flow.current_step_index,
            "executing flow"
        );

        loop {
            if token.is_cancelled() {
                return self.interrupted(flow).await;
            }
            if flow.is_at_end() {
                return self.complete(flow).await;
            }

            let index = flow.current_step_index;
            let group = parallel_group(blueprint, index);
            let next = if group.len() > 1 {
                self.run_group(blueprint, flow, &group, token).await?
            } else {
                self.run_step(blueprint, flow, index, token).await?
            };

            if let Next::Stop(result) = next {
                return Ok(result);
            }
        }
    }

    async fn run_step(
        &self,
        blueprint: &Arc<FlowBlueprint>,
        flow: &mut FlowInstance,
        index: usize,
        token: &CancellationToken,
    ) -> Result<Next, EngineError> {
        let step = blueprint
            .top_step(index)
            .ok_or_else(|| EngineError::InvalidDefinition {
                flow_type: flow.flow_type.clone(),
                reason: format!("run has step index {index} but the blueprint has {} steps", blueprint.len()),
            })?;
        let ctx = self.context(flow, token);

        let gate_cleared = flow.resume_token == Some(index);
        if gate_cleared {
            flow.resume_token = None;
        }

        // A skipped step never reaches its pause gate.
        if let Some(reason) = blocked_reason(step, flow, &ctx) {
            self.skip(flow, index, &ctx, &reason).await?;
            flow.set_current_step(index + 1);
            return Ok(Next::Continue);
        }

        if !gate_cleared && step.pause.as_ref().is_some_and(|gate| gate.holds(&ctx)) {
            return self.pause(flow, step, index).await.map(Next::Stop);
        }

        self.begin_step(flow, index);
        let execution = self.steps.execute(blueprint, step, ctx.clone()).await;
        self.apply(flow, index, &ctx, &execution).await?;

        if execution.error == Some(StepError::Cancelled) && token.is_cancelled() {
            return self.interrupted(flow).await.map(Next::Stop);
        }
        if step.critical {
            self.checkpoints.save(flow).await?;
        }

        if !execution.is_success() {
            if step.allow_failure {
                tracing::warn!(
                    flow_id = %flow.id,
                    step = step.name.as_str(),
                    error = execution.error_message().as_deref().unwrap_or("unknown"),
                    "step failed; continuing because failure is allowed"
                );
                flow.set_current_step(index + 1);
                return Ok(Next::Continue);
            }
            let message = step_failure_message(&step.name, &execution);
            return self.fail(flow, Some(&step.name), message).await.map(Next::Stop);
        }

        let target = execution.jump_to.clone().or_else(|| step.jump_to.clone());
        match target {
            Some(target) => self.jump(blueprint, flow, index, &target).await,
            None => {
                flow.set_current_step(index + 1);
                Ok(Next::Continue)
            }
        }
    }

    /// Run a group of independent parallel steps starting at `group[0]`.
    async fn run_group(
        &self,
        blueprint: &Arc<FlowBlueprint>,
        flow: &mut FlowInstance,
        group: &[usize],
        token: &CancellationToken,
    ) -> Result<Next, EngineError> {
        let ctx = self.context(flow, token);
        let mut join_set = JoinSet::new();

        for &index in group {
            let Some(step) = blueprint.top_step(index) else {
                continue;
            };
            if let Some(reason) = blocked_reason(step, flow, &ctx) {
                self.skip(flow, index, &ctx, &reason).await?;
                continue;
            }
            self.begin_step(flow, index);

            let executor = self.steps.clone();
            let blueprint = Arc::clone(blueprint);
            let ctx = ctx.clone();
            join_set.spawn(async move {
                let execution = match blueprint.top_step(index) {
                    Some(step) => AssertUnwindSafe(executor.execute(&blueprint, step, ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            StepExecution::from_error(StepError::fatal("step panicked"), 0, Vec::new())
                        }),
                    None => StepExecution::from_error(StepError::fatal("step not found"), 0, Vec::new()),
                };
                (index, execution)
            });
        }

        tracing::debug!(
            flow_id = %flow.id,
            steps = join_set.len(),
            first = group[0],
            "running parallel step group"
        );

        let mut finished = Vec::with_capacity(join_set.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(done) => finished.push(done),
                Err(e) => tracing::error!(flow_id = %flow.id, error = %e, "parallel step task aborted"),
            }
        }
        finished.sort_by_key(|(index, _)| *index);

        let mut failure = None;
        let mut cancelled = false;
        let mut critical = false;
        for (index, execution) in &finished {
            self.apply(flow, *index, &ctx, execution).await?;
            let Some(step) = blueprint.top_step(*index) else {
                continue;
            };
            critical |= step.critical;
            cancelled |= execution.error == Some(StepError::Cancelled);
            if execution.jump_to.is_some() {
                tracing::warn!(
                    flow_id = %flow.id,
                    step = step.name.as_str(),
                    "jump requested from a parallel step; ignored"
                );
            }
            if !execution.is_success() && !step.allow_failure && failure.is_none() {
                failure = Some((step.name.clone(), step_failure_message(&step.name, execution)));
            }
        }

        if cancelled && token.is_cancelled() {
            return self.interrupted(flow).await.map(Next::Stop);
        }
        if critical {
            self.checkpoints.save(flow).await?;
        }
        if let Some((step, message)) = failure {
            return self.fail(flow, Some(&step), message).await.map(Next::Stop);
        }

        let last = group.last().copied().unwrap_or(flow.current_step_index);
        flow.set_current_step(last + 1);
        Ok(Next::Continue)
    }

    // -----------------------------------------------------------------------
    // Step bookkeeping
    // -----------------------------------------------------------------------

    fn context(&self, flow: &FlowInstance, token: &CancellationToken) -> FlowExecutionContext {
        FlowExecutionContext::from_flow(flow, self.services.clone(), token.clone())
    }

    fn begin_step(&self, flow: &mut FlowInstance, index: usize) {
        let Some(state) = flow.steps.get_mut(index) else {
            return;
        };
        state.status = StepStatus::Running;
        state.started_at = Some(Utc::now());
        state.completed_at = None;
        state.last_error = None;
        let name = state.name.clone();
        flow.set_current_step(index);
        self.checkpoints.step_changed(flow.id, &name, StepStatus::Running);
    }

    async fn apply(
        &self,
        flow: &mut FlowInstance,
        index: usize,
        ctx: &FlowExecutionContext,
        execution: &StepExecution,
    ) -> Result<(), EngineError> {
        let Some(state) = flow.steps.get_mut(index) else {
            return Ok(());
        };
        state.status = execution.status;
        state.result = Some(execution.result.clone());
        state.attempts = execution.attempts;
        state.last_error = execution.error_message();
        state.completed_at = Some(Utc::now());
        let name = state.name.clone();

        if execution.is_success() {
            flow.data
                .extend(execution.data.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let mut events = execution.events.clone();
        events.push(outcome_event(ctx, &name, execution, None));
        self.checkpoints.record_all(flow, events).await?;
        self.checkpoints.step_changed(flow.id, &name, execution.status);
        Ok(())
    }

    async fn skip(
        &self,
        flow: &mut FlowInstance,
        index: usize,
        ctx: &FlowExecutionContext,
        reason: &str,
    ) -> Result<(), EngineError> {
        let Some(state) = flow.steps.get_mut(index) else {
            return Ok(());
        };
        state.status = StepStatus::Skipped;
        state.completed_at = Some(Utc::now());
        let name = state.name.clone();

        tracing::debug!(flow_id = %flow.id, step = name.as_str(), reason, "step skipped");
        self.checkpoints
            .record(flow, skipped_event(ctx, &name, reason, None))
            .await?;
        self.checkpoints.step_changed(flow.id, &name, StepStatus::Skipped);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run transitions
    // -----------------------------------------------------------------------

    async fn pause(
        &self,
        flow: &mut FlowInstance,
        step: &FlowStep,
        index: usize,
    ) -> Result<FlowResult, EngineError> {
        let resume = step.effective_resume();
        flow.set_current_step(index);
        flow.active_resume = Some(resume.clone());
        flow.transition(FlowStatus::Paused)?;

        let event = FlowEvent::new(
            flow.id,
            FlowEventType::Paused,
            json!({ "step": step.name, "resume": resume }),
        );
        self.checkpoints.record(flow, event).await?;
        self.checkpoints.save(flow).await?;

        tracing::info!(
            flow_id = %flow.id,
            step = step.name.as_str(),
            reason = ?resume.reason,
            timeout_ms = resume.timeout_ms,
            "flow paused"
        );
        Ok(FlowResult::of(flow))
    }

    async fn complete(&self, flow: &mut FlowInstance) -> Result<FlowResult, EngineError> {
        let steps = flow.steps.len();
        flow.set_current_step(steps);
        flow.transition(FlowStatus::Completed)?;
        let event = FlowEvent::new(
            flow.id,
            FlowEventType::Completed,
            json!({ "steps": steps, "jump_count": flow.jump_count }),
        );
        self.checkpoints.record(flow, event).await?;
        self.checkpoints.save(flow).await?;

        tracing::info!(flow_id = %flow.id, flow_type = flow.flow_type.as_str(), "flow completed");
        Ok(FlowResult::of(flow))
    }

    /// Fail the run with `message`.
    pub(crate) async fn fail(
        &self,
        flow: &mut FlowInstance,
        step: Option<&str>,
        message: String,
    ) -> Result<FlowResult, EngineError> {
        flow.last_error = Some(message.clone());
        flow.transition(FlowStatus::Failed)?;
        let event = FlowEvent::new(
            flow.id,
            FlowEventType::Failed,
            json!({ "step": step, "error": message }),
        );
        self.checkpoints.record(flow, event).await?;
        self.checkpoints.save(flow).await?;
        self.checkpoints.error(flow.id, message.as_str());

        tracing::error!(flow_id = %flow.id, step, error = message.as_str(), "flow failed");
        Ok(FlowResult::of(flow))
    }

    async fn jump(
        &self,
        blueprint: &FlowBlueprint,
        flow: &mut FlowInstance,
        from: usize,
        target: &str,
    ) -> Result<Next, EngineError> {
        let from_name = flow.steps.get(from).map(|s| s.name.clone()).unwrap_or_default();
        let Some(to) = blueprint.top_index(target) else {
            let message = format!("step '{from_name}' jumped to unknown step '{target}'");
            return self.fail(flow, Some(&from_name), message).await.map(Next::Stop);
        };

        flow.jump_count += 1;
        let max = blueprint.max_jumps().unwrap_or(self.max_jumps);
        if flow.jump_count > max {
            let err = EngineError::MaxJumpsExceeded { flow_id: flow.id, max };
            return self
                .fail(flow, Some(&from_name), err.to_string())
                .await
                .map(Next::Stop);
        }

        let now = Utc::now();
        for state in flow.steps.iter_mut().take(to).skip(from + 1) {
            state.status = StepStatus::Skipped;
            state.completed_at = Some(now);
        }
        for state in flow.steps.iter_mut().skip(to) {
            state.reset();
        }

        let event = FlowEvent::new(
            flow.id,
            FlowEventType::Jumped,
            json!({ "from": from_name, "to": target, "jump_count": flow.jump_count }),
        );
        self.checkpoints.record(flow, event).await?;
        flow.set_current_step(to);

        tracing::debug!(
            flow_id = %flow.id,
            from = from_name.as_str(),
            to = target,
            jump_count = flow.jump_count,
            "flow jumped"
        );
        Ok(Next::Continue)
    }

    /// The run token fired: adopt a cancellation recorded by the repository,
    /// otherwise leave the run where it is so it can be recovered.
    async fn interrupted(&self, flow: &mut FlowInstance) -> Result<FlowResult, EngineError> {
        let stored = self.checkpoints.reload(flow.id).await?;
        if stored.status == FlowStatus::Cancelled {
            *flow = stored;
            tracing::info!(flow_id = %flow.id, "flow cancelled at step boundary");
        } else {
            tracing::info!(
                flow_id = %flow.id,
                step_index = flow.current_step_index,
                "flow interrupted; left for recovery"
            );
        }
        Ok(FlowResult::of(flow))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Indices of the parallel group starting at `start` (a single index when the
/// step cannot run in parallel).
fn parallel_group(blueprint: &FlowBlueprint, start: usize) -> Vec<usize> {
    let mut group = Vec::new();
    let mut names: Vec<&str> = Vec::new();
    for index in start..blueprint.len() {
        let Some(step) = blueprint.top_step(index) else {
            break;
        };
        let independent = !step.dependencies.iter().any(|d| names.contains(&d.as_str()));
        let eligible = step.can_run_in_parallel
            && step.pause.is_none()
            && step.jump_to.is_none()
            && independent;
        if !eligible {
            break;
        }
        names.push(step.name.as_str());
        group.push(index);
    }
    if group.is_empty() {
        group.push(start);
    }
    group
}

/// Why `step` must be skipped, if it must.
fn blocked_reason(step: &FlowStep, flow: &FlowInstance, ctx: &FlowExecutionContext) -> Option<String> {
    if let Some(dep) = step
        .dependencies
        .iter()
        .find(|d| flow.step(d).map(|s| s.status) != Some(StepStatus::Succeeded))
    {
        return Some(format!("dependency '{dep}' has not succeeded"));
    }
    if step.condition.as_ref().is_some_and(|condition| !condition(ctx)) {
        return Some("condition not met".to_string());
    }
    None
}

fn step_failure_message(step: &str, execution: &StepExecution) -> String {
    let err = match &execution.error {
        Some(StepError::Timeout(_)) => EngineError::Timeout {
            step: step.to_string(),
        },
        Some(e) => EngineError::StepExecutionFailed {
            step: step.to_string(),
            error: e.to_string(),
        },
        None => EngineError::StepExecutionFailed {
            step: step.to_string(),
            error: execution.result.message.clone().unwrap_or_default(),
        },
    };
    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use waypoint_types::resume::ResumeConfig;

    use crate::event::bus::NotificationBus;
    use crate::flow::blueprint::{FlowBlueprintBuilder, PauseCondition};
    use crate::flow::handler::StepOutput;
    use crate::flow::runtime::RuntimeFlowStore;
    use crate::flow::step_executor::tests::{CacheOnlyRepo, executor};

    fn flow_executor() -> FlowExecutor<CacheOnlyRepo> {
        let (steps, repo) = executor();
        let checkpoints = Arc::new(CheckpointManager::new(
            repo,
            Arc::new(RuntimeFlowStore::new()),
            NotificationBus::new(16),
        ));
        FlowExecutor::new(steps, checkpoints, Services::new(), 3)
    }

    fn instance(bp: &FlowBlueprint) -> FlowInstance {
        let mut flow = FlowInstance::new(
            Uuid::now_v7(),
            bp.flow_type(),
            "alice",
            "corr",
            bp.step_names(),
            BTreeMap::new(),
        );
        flow.transition(FlowStatus::Ready).unwrap();
        flow
    }

    fn ok_step(name: &str) -> FlowStep {
        let key = name.to_string();
        FlowStep::from_fn(name, move |_ctx| {
            let key = key.clone();
            async move { Ok(StepOutput::new().set(key, true)) }
        })
    }

    fn status_of(flow: &FlowInstance, name: &str) -> StepStatus {
        flow.step(name).map(|s| s.status).unwrap()
    }

    #[tokio::test]
    async fn walks_steps_in_order_and_completes() {
        let bp = Arc::new(
            FlowBlueprintBuilder::new("order")
                .step(ok_step("a"))
                .step(ok_step("b").depends_on("a"))
                .build(),
        );
        let mut flow = instance(&bp);
        let result = flow_executor()
            .execute(&bp, &mut flow, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_completed());
        assert_eq!(flow.current_step_index, 2);
        assert_eq!(flow.data["b"], json!(true));
        assert!(flow.events.iter().any(|e| e.event_type == FlowEventType::Completed));
    }

    #[tokio::test]
    async fn unmet_dependency_skips_step() {
        let bp = Arc::new(
            FlowBlueprintBuilder::new("order")
                .step(
                    FlowStep::from_fn("a", |_ctx| async { Err(StepError::fatal("nope")) })
                        .allow_failure(),
                )
                .step(ok_step("b").depends_on("a"))
                .build(),
        );
        let mut flow = instance(&bp);
        let result = flow_executor()
            .execute(&bp, &mut flow, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_completed());
        assert_eq!(status_of(&flow, "a"), StepStatus::Failed);
        assert_eq!(status_of(&flow, "b"), StepStatus::Skipped);
        assert!(!flow.data.contains_key("b"));
    }

    #[tokio::test]
    async fn skipped_step_does_not_reach_its_pause_gate() {
        let bp = Arc::new(
            FlowBlueprintBuilder::new("order")
                .step(
                    FlowStep::from_fn("a", |_ctx| async { Err(StepError::fatal("nope")) })
                        .allow_failure(),
                )
                .step(ok_step("b").depends_on("a").pause_when(PauseCondition::always()))
                .step(ok_step("c").when(|_ctx| false).pause_when(PauseCondition::always()))
                .step(ok_step("d"))
                .build(),
        );
        let mut flow = instance(&bp);
        let result = flow_executor()
            .execute(&bp, &mut flow, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_completed());
        assert_eq!(status_of(&flow, "b"), StepStatus::Skipped);
        assert_eq!(status_of(&flow, "c"), StepStatus::Skipped);
        assert_eq!(status_of(&flow, "d"), StepStatus::Succeeded);
        assert!(flow.active_resume.is_none());
        assert!(!flow.events.iter().any(|e| e.event_type == FlowEventType::Paused));
    }

    #[tokio::test]
    async fn failing_step_fails_the_flow() {
        let bp = Arc::new(
            FlowBlueprintBuilder::new("order")
                .step(FlowStep::from_fn("a", |_ctx| async { Err(StepError::fatal("card declined")) }))
                .step(ok_step("b"))
                .build(),
        );
        let mut flow = instance(&bp);
        let result = flow_executor()
            .execute(&bp, &mut flow, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, FlowStatus::Failed);
        assert!(result.error.unwrap().contains("card declined"));
        assert_eq!(status_of(&flow, "b"), StepStatus::Pending);
    }

    #[tokio::test]
    async fn parallel_group_runs_concurrently() {
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let make = |name: &'static str| {
            let barrier = Arc::clone(&barrier);
            FlowStep::from_fn(name, move |_ctx| {
                let barrier = Arc::clone(&barrier);
                async move {
                    barrier.wait().await;
                    Ok(StepOutput::new().set(name, true))
                }
            })
            .parallel()
        };
        let bp = Arc::new(
            FlowBlueprintBuilder::new("order")
                .step(make("a"))
                .step(make("b"))
                .build(),
        );
        let mut flow = instance(&bp);
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            flow_executor().execute(&bp, &mut flow, &CancellationToken::new()),
        )
        .await
        .expect("parallel steps deadlocked")
        .unwrap();

        assert!(result.is_completed());
        assert_eq!(status_of(&flow, "a"), StepStatus::Succeeded);
        assert_eq!(status_of(&flow, "b"), StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn pause_gate_stops_and_resume_token_passes_it_once() {
        let bp = Arc::new(
            FlowBlueprintBuilder::new("order")
                .step(ok_step("a"))
                .step(
                    ok_step("approve")
                        .pause_when(PauseCondition::always())
                        .resume_with(ResumeConfig::after(Duration::from_secs(5))),
                )
                .build(),
        );
        let exec = flow_executor();
        let mut flow = instance(&bp);

        let paused = exec.execute(&bp, &mut flow, &CancellationToken::new()).await.unwrap();
        assert!(paused.is_paused());
        assert_eq!(flow.current_step_index, 1);
        assert_eq!(flow.active_resume.as_ref().and_then(|r| r.timeout_ms), Some(5000));

        flow.resume_token = Some(1);
        let done = exec.execute(&bp, &mut flow, &CancellationToken::new()).await.unwrap();
        assert!(done.is_completed());
        assert_eq!(status_of(&flow, "approve"), StepStatus::Succeeded);
        assert!(flow.resume_token.is_none());
    }

    #[tokio::test]
    async fn jumps_are_bounded() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let bp = Arc::new(
            FlowBlueprintBuilder::new("loop")
                .step(FlowStep::from_fn("poll", move |_ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(StepOutput::new()) }
                }))
                .step(ok_step("again").jump_to("poll"))
                .build(),
        );
        let mut flow = instance(&bp);
        let result = flow_executor()
            .execute(&bp, &mut flow, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, FlowStatus::Failed);
        assert!(result.error.unwrap().contains("maximum of 3 jumps"));
        assert_eq!(flow.jump_count, 4);
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(
            flow.events.iter().filter(|e| e.event_type == FlowEventType::Jumped).count(),
            3
        );
    }

    #[tokio::test]
    async fn forward_jump_skips_steps_in_between() {
        let bp = Arc::new(
            FlowBlueprintBuilder::new("order")
                .step(FlowStep::from_fn("route", |_ctx| async {
                    Ok(StepOutput::new().jump_to("ship"))
                }))
                .step(ok_step("review"))
                .step(ok_step("ship"))
                .build(),
        );
        let mut flow = instance(&bp);
        let result = flow_executor()
            .execute(&bp, &mut flow, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_completed());
        assert_eq!(status_of(&flow, "review"), StepStatus::Skipped);
        assert_eq!(status_of(&flow, "ship"), StepStatus::Succeeded);
        assert_eq!(flow.jump_count, 1);
    }

    #[test]
    fn parallel_group_stops_at_dependent_step() {
        let bp = FlowBlueprintBuilder::new("order")
            .step(ok_step("a").parallel())
            .step(ok_step("b").parallel())
            .step(ok_step("c").parallel().depends_on("a"))
            .build();
        assert_eq!(parallel_group(&bp, 0), vec![0, 1]);
        assert_eq!(parallel_group(&bp, 2), vec![2]);
    }
}
