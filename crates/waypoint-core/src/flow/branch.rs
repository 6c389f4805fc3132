//! Branch scheduling.
//!
//! Static branches: conditions are evaluated in declaration order, the first
//! matching non-default branch runs, otherwise the default branch. With no
//! match and no default the step runs no branch (a `BranchSkipped` event and a
//! warning; blueprints can reject this shape up front via `strict_branching`).
//!
//! Dynamic branches: a selector yields items, a factory turns each item into
//! a `GeneratedBranch`, and the declared `ExecutionStrategy` schedules them.
//! Concurrent strategies spawn one task per branch on a `JoinSet`; a failing
//! critical branch cancels a child token shared by its siblings, which stop
//! at their next step boundary.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use waypoint_types::event::{FlowEvent, FlowEventType};
use waypoint_types::flow::{StepResult, StepStatus};

use crate::repository::flow::FlowRepository;

use super::blueprint::{
    DynamicBranching, ExecutionStrategy, FlowBlueprint, FlowStep, GeneratedBranch, Predicate,
};
use super::context::{BranchItem, FlowExecutionContext};
use super::step_executor::{StepExecutor, outcome_event, skipped_event};

const DEFAULT_RESOURCE_GROUP: &str = "default";

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of one branch, recorded in the parent step's payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchReport {
    pub name: String,
    pub success: bool,
    /// The branch never ran (aborted after a critical sibling failed).
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    pub message: Option<String>,
    pub payload: Option<Value>,
}

/// A finished branch with the data and events it produced.
#[derive(Debug, Clone)]
pub struct BranchRun {
    pub report: BranchReport,
    pub data: BTreeMap<String, Value>,
    pub events: Vec<FlowEvent>,
}

impl BranchRun {
    fn aborted(name: &str) -> Self {
        Self {
            report: BranchReport {
                name: name.to_string(),
                success: false,
                skipped: true,
                message: Some("aborted after a critical branch failed".to_string()),
                payload: None,
            },
            data: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    fn failed(name: &str, message: &str) -> Self {
        Self {
            report: BranchReport {
                name: name.to_string(),
                success: false,
                skipped: false,
                message: Some(message.to_string()),
                payload: None,
            },
            data: BTreeMap::new(),
            events: Vec::new(),
        }
    }
}

/// Combined outcome of a step's branches, in branch order.
#[derive(Debug, Clone, Default)]
pub struct BranchOutcome {
    pub reports: Vec<BranchReport>,
    pub data: BTreeMap<String, Value>,
    pub events: Vec<FlowEvent>,
    /// Name of the static branch that ran, if any.
    pub selected: Option<String>,
}

impl BranchOutcome {
    pub fn success(&self) -> bool {
        self.reports.iter().all(|r| r.success)
    }

    fn push(&mut self, run: BranchRun) {
        if run.report.success {
            self.data.extend(run.data);
        }
        self.events.extend(run.events);
        self.reports.push(run.report);
    }
}

// ---------------------------------------------------------------------------
// Static selection
// ---------------------------------------------------------------------------

/// Static branch viewed independently of where it is stored.
struct StaticBranch<'a> {
    name: &'a str,
    is_default: bool,
    condition: Option<&'a Predicate>,
    steps: Vec<&'a FlowStep>,
}

fn static_branches<'a>(blueprint: &'a FlowBlueprint, step: &'a FlowStep) -> Vec<StaticBranch<'a>> {
    let arena = blueprint.arena();
    let stored = step.branches.iter().filter_map(|id| arena.branch(*id)).map(|b| StaticBranch {
        name: b.name.as_str(),
        is_default: b.is_default,
        condition: b.condition.as_ref(),
        steps: b.steps.iter().filter_map(|id| arena.step(*id)).collect(),
    });
    let inline = step.inline_branches.iter().map(|b| StaticBranch {
        name: b.name.as_str(),
        is_default: b.is_default,
        condition: b.condition.as_ref(),
        steps: b.steps.iter().collect(),
    });
    stored.chain(inline).collect()
}

/// Index of the branch to run: first matching conditional, else the default.
fn select_branch(candidates: &[StaticBranch<'_>], ctx: &FlowExecutionContext) -> Option<usize> {
    candidates
        .iter()
        .position(|b| !b.is_default && b.condition.is_some_and(|c| c(ctx)))
        .or_else(|| candidates.iter().position(|b| b.is_default))
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

struct BranchJob {
    index: usize,
    branch: GeneratedBranch,
    ctx: FlowExecutionContext,
}

enum Limit {
    Unbounded,
    Global(usize),
    PerGroup(usize),
}

impl<R: FlowRepository + 'static> StepExecutor<R> {
    /// Run the static and dynamic branches of `step`.
    pub(crate) async fn run_branches(
        &self,
        blueprint: &Arc<FlowBlueprint>,
        step: &FlowStep,
        ctx: FlowExecutionContext,
    ) -> BranchOutcome {
        let mut outcome = BranchOutcome::default();

        if step.has_branches() {
            let candidates = static_branches(blueprint, step);
            match select_branch(&candidates, &ctx) {
                Some(index) => {
                    let chosen = &candidates[index];
                    tracing::debug!(
                        flow_id = %ctx.flow_id,
                        step = step.name.as_str(),
                        branch = chosen.name,
                        default = chosen.is_default,
                        "selected static branch"
                    );
                    outcome.selected = Some(chosen.name.to_string());
                    let run = self
                        .run_branch_steps(blueprint, chosen.name, chosen.steps.clone(), ctx.clone())
                        .await;
                    outcome.push(run);
                }
                None => {
                    tracing::warn!(
                        flow_id = %ctx.flow_id,
                        step = step.name.as_str(),
                        "no branch condition matched and no default branch exists; skipping branches"
                    );
                    outcome.events.push(FlowEvent::new(
                        ctx.flow_id,
                        FlowEventType::BranchSkipped,
                        json!({ "step": step.name, "candidates": candidates.len() }),
                    ));
                }
            }
        }

        if let Some(dynamic) = &step.dynamic {
            let mut dynamic_ctx = ctx;
            dynamic_ctx.merge(&outcome.data);
            for run in self.run_dynamic(blueprint, step, dynamic, dynamic_ctx).await {
                outcome.push(run);
            }
        }

        outcome
    }

    /// Run the sub-steps of one branch in order.
    pub(crate) fn run_branch_steps<'a>(
        &'a self,
        blueprint: &'a Arc<FlowBlueprint>,
        branch: &'a str,
        steps: Vec<&'a FlowStep>,
        ctx: FlowExecutionContext,
    ) -> BoxFuture<'a, BranchRun> {
        Box::pin(async move {
            let mut ctx = ctx;
            let mut data = BTreeMap::new();
            let mut events = Vec::new();
            let mut last: Option<StepResult> = None;
            let mut failure: Option<String> = None;

            for step in steps {
                if ctx.is_cancelled() {
                    failure = Some("cancelled".to_string());
                    break;
                }

                let unmet = step.dependencies.iter().find(|d| !ctx.step_succeeded(d));
                if let Some(dep) = unmet {
                    tracing::debug!(branch, step = step.name.as_str(), dependency = dep.as_str(), "dependency not met; skipping");
                    ctx.record_step(&step.name, StepStatus::Skipped, None);
                    events.push(skipped_event(&ctx, &step.name, "dependency_not_met", Some(branch)));
                    continue;
                }
                if step.condition.as_ref().is_some_and(|c| !c(&ctx)) {
                    ctx.record_step(&step.name, StepStatus::Skipped, None);
                    events.push(skipped_event(&ctx, &step.name, "condition_false", Some(branch)));
                    continue;
                }

                let execution = self.execute(blueprint, step, ctx.clone()).await;
                events.extend(execution.events.iter().cloned());
                events.push(outcome_event(&ctx, &step.name, &execution, Some(branch)));
                if execution.jump_to.is_some() {
                    tracing::warn!(branch, step = step.name.as_str(), "jumps are ignored inside branches");
                }

                if execution.is_success() {
                    ctx.merge(&execution.data);
                    data.extend(execution.data);
                    ctx.record_step(&step.name, StepStatus::Succeeded, Some(execution.result.clone()));
                    last = Some(execution.result);
                } else {
                    ctx.record_step(&step.name, StepStatus::Failed, Some(execution.result.clone()));
                    if step.allow_failure {
                        continue;
                    }
                    failure = Some(format!(
                        "step '{}' failed: {}",
                        step.name,
                        execution.error_message().unwrap_or_default()
                    ));
                    break;
                }
            }

            let report = match failure {
                Some(message) => BranchReport {
                    name: branch.to_string(),
                    success: false,
                    skipped: false,
                    message: Some(message),
                    payload: last.and_then(|r| r.payload),
                },
                None => BranchReport {
                    name: branch.to_string(),
                    success: true,
                    skipped: false,
                    message: last.as_ref().and_then(|r| r.message.clone()),
                    payload: last.and_then(|r| r.payload),
                },
            };
            BranchRun { report, data, events }
        })
    }

    async fn run_dynamic(
        &self,
        blueprint: &Arc<FlowBlueprint>,
        step: &FlowStep,
        dynamic: &DynamicBranching,
        ctx: FlowExecutionContext,
    ) -> Vec<BranchRun> {
        let items = (dynamic.selector)(&ctx);
        // Siblings share a child token so a critical failure can stop them
        // without cancelling the whole flow.
        let siblings = ctx.cancellation().child_token();

        let mut jobs: Vec<BranchJob> = items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let branch = (dynamic.factory)(item, index, &ctx);
                if branch.steps.iter().any(|s| s.pause.is_some() || s.jump_to.is_some()) {
                    tracing::warn!(
                        step = step.name.as_str(),
                        branch = branch.name.as_str(),
                        "pause gates and jumps are ignored inside generated branches"
                    );
                }
                let job_ctx = ctx
                    .clone()
                    .with_cancellation(siblings.clone())
                    .with_branch(BranchItem {
                        branch: branch.name.clone(),
                        index,
                        item: branch.source_data.clone().unwrap_or_else(|| item.clone()),
                    });
                BranchJob { index, branch, ctx: job_ctx }
            })
            .collect();

        tracing::info!(
            flow_id = %ctx.flow_id,
            step = step.name.as_str(),
            branches = jobs.len(),
            strategy = ?dynamic.strategy,
            "running dynamic branches"
        );

        let mut runs = match dynamic.strategy {
            ExecutionStrategy::Sequential => self.run_sequential(blueprint, jobs, &siblings).await,
            ExecutionStrategy::Parallel => {
                self.run_concurrent(blueprint, jobs, Limit::Unbounded, &siblings).await
            }
            ExecutionStrategy::RoundRobin => {
                self.run_concurrent(blueprint, jobs, Limit::PerGroup(dynamic.max_concurrency), &siblings)
                    .await
            }
            ExecutionStrategy::Batched => {
                self.run_batched(blueprint, jobs, dynamic, &siblings).await
            }
            ExecutionStrategy::PriorityBased => {
                jobs.sort_by(|a, b| b.branch.priority.cmp(&a.branch.priority));
                self.run_concurrent(blueprint, jobs, Limit::Global(dynamic.max_concurrency), &siblings)
                    .await
            }
        };

        runs.sort_by_key(|(index, _)| *index);
        runs.into_iter().map(|(_, run)| run).collect()
    }

    async fn run_sequential(
        &self,
        blueprint: &Arc<FlowBlueprint>,
        jobs: Vec<BranchJob>,
        siblings: &CancellationToken,
    ) -> Vec<(usize, BranchRun)> {
        let mut runs = Vec::with_capacity(jobs.len());
        for job in jobs {
            if siblings.is_cancelled() {
                runs.push((job.index, BranchRun::aborted(&job.branch.name)));
                continue;
            }
            let steps: Vec<&FlowStep> = job.branch.steps.iter().collect();
            let run = self
                .run_branch_steps(blueprint, &job.branch.name, steps, job.ctx)
                .await;
            if job.branch.critical && !run.report.success {
                tracing::warn!(branch = job.branch.name.as_str(), "critical branch failed; aborting remaining branches");
                siblings.cancel();
            }
            runs.push((job.index, run));
        }
        runs
    }

    async fn run_batched(
        &self,
        blueprint: &Arc<FlowBlueprint>,
        jobs: Vec<BranchJob>,
        dynamic: &DynamicBranching,
        siblings: &CancellationToken,
    ) -> Vec<(usize, BranchRun)> {
        let batch_size = dynamic.batch_size.max(1);
        let mut runs = Vec::with_capacity(jobs.len());
        let mut pending = jobs.into_iter().peekable();

        while pending.peek().is_some() {
            let batch: Vec<BranchJob> = pending.by_ref().take(batch_size).collect();
            if siblings.is_cancelled() {
                runs.extend(batch.iter().map(|j| (j.index, BranchRun::aborted(&j.branch.name))));
                continue;
            }
            runs.extend(
                self.run_concurrent(blueprint, batch, Limit::Unbounded, siblings)
                    .await,
            );
            if pending.peek().is_some() && !dynamic.batch_delay.is_zero() {
                tokio::time::sleep(dynamic.batch_delay).await;
            }
        }
        runs
    }

    async fn run_concurrent(
        &self,
        blueprint: &Arc<FlowBlueprint>,
        jobs: Vec<BranchJob>,
        limit: Limit,
        siblings: &CancellationToken,
    ) -> Vec<(usize, BranchRun)> {
        let mut runs = Vec::with_capacity(jobs.len());
        let mut join_set = JoinSet::new();
        let mut spawned: HashMap<usize, String> = HashMap::new();
        let global = match limit {
            Limit::Global(n) => Some(Arc::new(Semaphore::new(n.max(1)))),
            _ => None,
        };
        let mut groups: HashMap<String, Arc<Semaphore>> = HashMap::new();

        for job in jobs {
            // Global permits are taken in submission order so higher
            // priorities start first.
            let permit: Option<OwnedSemaphorePermit> = match &global {
                Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
                None => None,
            };
            if siblings.is_cancelled() {
                runs.push((job.index, BranchRun::aborted(&job.branch.name)));
                continue;
            }
            let group = match limit {
                Limit::PerGroup(n) => {
                    let key = job
                        .branch
                        .resource_group
                        .clone()
                        .unwrap_or_else(|| DEFAULT_RESOURCE_GROUP.to_string());
                    Some(Arc::clone(
                        groups
                            .entry(key)
                            .or_insert_with(|| Arc::new(Semaphore::new(n.max(1)))),
                    ))
                }
                _ => None,
            };

            let executor = self.clone();
            let blueprint = Arc::clone(blueprint);
            let siblings = siblings.clone();
            let BranchJob { index, branch, ctx } = job;
            spawned.insert(index, branch.name.clone());

            join_set.spawn(async move {
                let _permit = permit;
                let _group_permit = match group {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                if siblings.is_cancelled() {
                    return (index, BranchRun::aborted(&branch.name));
                }
                let steps: Vec<&FlowStep> = branch.steps.iter().collect();
                let run = AssertUnwindSafe(executor.run_branch_steps(&blueprint, &branch.name, steps, ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| BranchRun::failed(&branch.name, "branch panicked"));
                if branch.critical && !run.report.success {
                    tracing::warn!(branch = branch.name.as_str(), "critical branch failed; cancelling siblings");
                    siblings.cancel();
                }
                (index, run)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, run)) => {
                    spawned.remove(&index);
                    runs.push((index, run));
                }
                Err(e) => tracing::error!(error = %e, "branch task aborted"),
            }
        }
        for (index, name) in spawned {
            runs.push((index, BranchRun::failed(&name, "branch task aborted")));
        }
        runs
    }
}
