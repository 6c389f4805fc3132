//! Flow blueprints: the executable shape of a flow type.
//!
//! Step bodies, predicates and branch factories are code, so a flow type is
//! registered once as a `FlowBlueprint` and every run only persists its
//! `FlowInstance`. Steps and branches live in a flat `StepArena` addressed by
//! `StepId` / `BranchId`; a branch's sub-steps may carry branches of their own
//! without any pointer cycles.
//!
//! ```ignore
//! let blueprint = FlowBlueprintBuilder::new("order")
//!     .requires("amount", DataType::Integer)
//!     .step(FlowStep::new("validate", validate).critical())
//!     .step(
//!         FlowStep::new("route", noop())
//!             .depends_on("validate")
//!             .branch(BranchSpec::when("large", |ctx| ctx.get::<i64>("amount") > Some(1000)).step(review))
//!             .branch(BranchSpec::default_branch("small").step(auto_approve)),
//!     )
//!     .build();
//! ```

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use waypoint_types::error::EngineError;
use waypoint_types::flow::DataType;
use waypoint_types::resume::{PauseReason, ResumeConfig};

use super::context::FlowExecutionContext;
use super::handler::{StepHandler, StepOutput, StepError, step_fn};
use super::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Callable aliases
// ---------------------------------------------------------------------------

/// Opaque boolean predicate over the execution context.
pub type Predicate = Arc<dyn Fn(&FlowExecutionContext) -> bool + Send + Sync>;

/// Predicate over an event payload and the paused flow's context.
pub type EventPredicate = Arc<dyn Fn(&Value, &FlowExecutionContext) -> bool + Send + Sync>;

/// Produces the items a dynamic branching step fans out over.
pub type DataSelector = Arc<dyn Fn(&FlowExecutionContext) -> Vec<Value> + Send + Sync>;

/// Turns one selected item and its index into a branch.
pub type BranchFactory =
    Arc<dyn Fn(&Value, usize, &FlowExecutionContext) -> GeneratedBranch + Send + Sync>;

type KeyFn = Arc<dyn Fn(&FlowExecutionContext) -> String + Send + Sync>;

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(pub usize);

// ---------------------------------------------------------------------------
// Step policies
// ---------------------------------------------------------------------------

/// Idempotency key of a step: fixed, or computed from the context.
#[derive(Clone)]
pub enum IdempotencyKey {
    Static(String),
    Computed(KeyFn),
}

impl IdempotencyKey {
    pub fn resolve(&self, ctx: &FlowExecutionContext) -> String {
        match self {
            IdempotencyKey::Static(key) => key.clone(),
            IdempotencyKey::Computed(f) => f(ctx),
        }
    }
}

impl std::fmt::Debug for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdempotencyKey::Static(key) => f.debug_tuple("Static").field(key).finish(),
            IdempotencyKey::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Gate evaluated before a step body; when it holds the flow pauses.
#[derive(Clone)]
pub struct PauseCondition {
    pub predicate: Predicate,
    pub reason: PauseReason,
    pub message: Option<String>,
}

impl PauseCondition {
    pub fn when<F>(f: F) -> Self
    where
        F: Fn(&FlowExecutionContext) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(f),
            reason: PauseReason::Manual,
            message: None,
        }
    }

    pub fn always() -> Self {
        Self::when(|_| true)
    }

    pub fn reason(mut self, reason: PauseReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn holds(&self, ctx: &FlowExecutionContext) -> bool {
        (self.predicate)(ctx)
    }
}

// ---------------------------------------------------------------------------
// Dynamic branching
// ---------------------------------------------------------------------------

/// How generated branches are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
    /// Bounded concurrency per `resource_group`.
    RoundRobin,
    /// Fixed-size batches with a delay in between.
    Batched,
    /// Highest `priority` first, bounded by `max_concurrency`.
    PriorityBased,
}

/// Fan-out declaration of a step.
#[derive(Clone)]
pub struct DynamicBranching {
    pub selector: DataSelector,
    pub factory: BranchFactory,
    pub strategy: ExecutionStrategy,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub max_concurrency: usize,
}

impl DynamicBranching {
    pub fn new<S, F>(selector: S, factory: F) -> Self
    where
        S: Fn(&FlowExecutionContext) -> Vec<Value> + Send + Sync + 'static,
        F: Fn(&Value, usize, &FlowExecutionContext) -> GeneratedBranch + Send + Sync + 'static,
    {
        Self {
            selector: Arc::new(selector),
            factory: Arc::new(factory),
            strategy: ExecutionStrategy::Sequential,
            batch_size: 5,
            batch_delay: Duration::ZERO,
            max_concurrency: 4,
        }
    }

    pub fn strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn batched(mut self, batch_size: usize, batch_delay: Duration) -> Self {
        self.strategy = ExecutionStrategy::Batched;
        self.batch_size = batch_size.max(1);
        self.batch_delay = batch_delay;
        self
    }

    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }
}

impl std::fmt::Debug for DynamicBranching {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicBranching")
            .field("strategy", &self.strategy)
            .field("batch_size", &self.batch_size)
            .field("batch_delay", &self.batch_delay)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

/// Branch produced at run time by a `BranchFactory`.
#[derive(Debug, Clone)]
pub struct GeneratedBranch {
    pub name: String,
    pub steps: Vec<FlowStep>,
    pub resource_group: Option<String>,
    pub priority: i32,
    pub source_data: Option<Value>,
    /// A failing critical branch aborts its siblings.
    pub critical: bool,
}

impl GeneratedBranch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            resource_group: None,
            priority: 0,
            source_data: None,
            critical: false,
        }
    }

    pub fn step(mut self, step: FlowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn resource_group(mut self, group: impl Into<String>) -> Self {
        self.resource_group = Some(group.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn source(mut self, data: Value) -> Self {
        self.source_data = Some(data);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

// ---------------------------------------------------------------------------
// FlowStep
// ---------------------------------------------------------------------------

/// One unit of work.
#[derive(Clone)]
pub struct FlowStep {
    pub name: String,
    pub handler: Arc<dyn StepHandler>,
    pub dependencies: Vec<String>,
    pub required_data: Vec<(String, DataType)>,
    pub condition: Option<Predicate>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub can_run_in_parallel: bool,
    pub critical: bool,
    pub allow_failure: bool,
    pub idempotency: Option<IdempotencyKey>,
    /// Static branches stored in the arena.
    pub branches: Vec<BranchId>,
    /// Static branches not (yet) moved into an arena. The builder drains
    /// these; steps of generated branches keep them inline.
    pub inline_branches: Vec<BranchSpec>,
    pub dynamic: Option<DynamicBranching>,
    pub pause: Option<PauseCondition>,
    pub resume: Option<ResumeConfig>,
    pub resume_when: Option<Predicate>,
    pub event_matcher: Option<EventPredicate>,
    pub jump_to: Option<String>,
}

impl FlowStep {
    pub fn new(name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            dependencies: Vec::new(),
            required_data: Vec::new(),
            condition: None,
            retry: RetryPolicy::none(),
            timeout: None,
            can_run_in_parallel: false,
            critical: false,
            allow_failure: false,
            idempotency: None,
            branches: Vec::new(),
            inline_branches: Vec::new(),
            dynamic: None,
            pause: None,
            resume: None,
            resume_when: None,
            event_matcher: None,
            jump_to: None,
        }
    }

    /// Step whose body is an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(FlowExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<StepOutput, StepError>> + Send + 'static,
    {
        Self::new(name, step_fn(f))
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.dependencies.push(step.into());
        self
    }

    pub fn requires(mut self, key: impl Into<String>, data_type: DataType) -> Self {
        self.required_data.push((key.into(), data_type));
        self
    }

    pub fn when<F>(mut self, f: F) -> Self
    where
        F: Fn(&FlowExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(f));
        self
    }

    pub fn retry(mut self, max_retries: u32, delay: Duration) -> Self {
        self.retry = RetryPolicy::fixed(max_retries, delay);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn parallel(mut self) -> Self {
        self.can_run_in_parallel = true;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn idempotent(mut self, key: impl Into<String>) -> Self {
        self.idempotency = Some(IdempotencyKey::Static(key.into()));
        self
    }

    pub fn idempotent_by<F>(mut self, f: F) -> Self
    where
        F: Fn(&FlowExecutionContext) -> String + Send + Sync + 'static,
    {
        self.idempotency = Some(IdempotencyKey::Computed(Arc::new(f)));
        self
    }

    pub fn branch(mut self, spec: BranchSpec) -> Self {
        self.inline_branches.push(spec);
        self
    }

    pub fn dynamic(mut self, dynamic: DynamicBranching) -> Self {
        self.dynamic = Some(dynamic);
        self
    }

    pub fn pause_when(mut self, condition: PauseCondition) -> Self {
        self.pause = Some(condition);
        self
    }

    pub fn resume_with(mut self, config: ResumeConfig) -> Self {
        self.resume = Some(config);
        self
    }

    /// Condition trigger checked by the periodic pause monitor.
    pub fn resume_when<F>(mut self, f: F) -> Self
    where
        F: Fn(&FlowExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.resume_when = Some(Arc::new(f));
        self
    }

    /// Extra predicate an event must satisfy to resume this step.
    pub fn match_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &FlowExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.event_matcher = Some(Arc::new(f));
        self
    }

    pub fn jump_to(mut self, step: impl Into<String>) -> Self {
        self.jump_to = Some(step.into());
        self
    }

    /// Resume configuration applied when the pause gate holds.
    pub fn effective_resume(&self) -> ResumeConfig {
        let mut config = self.resume.clone().unwrap_or_else(ResumeConfig::manual);
        if let Some(pause) = &self.pause {
            if self.resume.is_none() {
                config.reason = pause.reason.clone();
            }
            if config.message.is_none() {
                config.message = pause.message.clone();
            }
        }
        config
    }

    pub fn has_branches(&self) -> bool {
        !self.branches.is_empty() || !self.inline_branches.is_empty()
    }
}

impl std::fmt::Debug for FlowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowStep")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("can_run_in_parallel", &self.can_run_in_parallel)
            .field("critical", &self.critical)
            .field("allow_failure", &self.allow_failure)
            .field("idempotency", &self.idempotency)
            .field("branches", &self.branches)
            .field("dynamic", &self.dynamic)
            .field("jump_to", &self.jump_to)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Static branches
// ---------------------------------------------------------------------------

/// Declaration of a static branch before it is placed in the arena.
#[derive(Clone)]
pub struct BranchSpec {
    pub name: String,
    pub is_default: bool,
    pub condition: Option<Predicate>,
    pub steps: Vec<FlowStep>,
}

impl BranchSpec {
    /// Branch selected when `f` holds.
    pub fn when<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&FlowExecutionContext) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            is_default: false,
            condition: Some(Arc::new(f)),
            steps: Vec::new(),
        }
    }

    /// Branch selected when no conditional branch matches.
    pub fn default_branch(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_default: true,
            condition: None,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: FlowStep) -> Self {
        self.steps.push(step);
        self
    }
}

impl std::fmt::Debug for BranchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchSpec")
            .field("name", &self.name)
            .field("is_default", &self.is_default)
            .field("steps", &self.steps.len())
            .finish()
    }
}

/// A static branch stored in the arena.
#[derive(Clone)]
pub struct FlowBranch {
    pub name: String,
    pub parent: StepId,
    pub is_default: bool,
    pub condition: Option<Predicate>,
    pub steps: Vec<StepId>,
}

impl std::fmt::Debug for FlowBranch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowBranch")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("is_default", &self.is_default)
            .field("steps", &self.steps)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Flat storage for every step and branch of a blueprint.
#[derive(Debug, Clone, Default)]
pub struct StepArena {
    steps: Vec<FlowStep>,
    branches: Vec<FlowBranch>,
}

impl StepArena {
    pub fn step(&self, id: StepId) -> Option<&FlowStep> {
        self.steps.get(id.0)
    }

    pub fn branch(&self, id: BranchId) -> Option<&FlowBranch> {
        self.branches.get(id.0)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Insert `step`, moving its inline branches (recursively) into the arena.
    fn insert(&mut self, mut step: FlowStep) -> StepId {
        let specs = std::mem::take(&mut step.inline_branches);
        let id = StepId(self.steps.len());
        self.steps.push(step);

        let mut branch_ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let branch_id = BranchId(self.branches.len());
            self.branches.push(FlowBranch {
                name: spec.name,
                parent: id,
                is_default: spec.is_default,
                condition: spec.condition,
                steps: Vec::new(),
            });
            let sub_ids: Vec<StepId> = spec.steps.into_iter().map(|s| self.insert(s)).collect();
            self.branches[branch_id.0].steps = sub_ids;
            branch_ids.push(branch_id);
        }
        self.steps[id.0].branches = branch_ids;
        id
    }
}

// ---------------------------------------------------------------------------
// FlowBlueprint
// ---------------------------------------------------------------------------

/// Non-fatal findings of blueprint validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlueprintReport {
    pub warnings: Vec<String>,
}

/// Registered, executable definition of a flow type.
#[derive(Debug, Clone)]
pub struct FlowBlueprint {
    flow_type: String,
    root: Vec<StepId>,
    arena: StepArena,
    max_jumps: Option<u32>,
    required_input: Vec<(String, DataType)>,
}

impl FlowBlueprint {
    pub fn flow_type(&self) -> &str {
        &self.flow_type
    }

    pub fn arena(&self) -> &StepArena {
        &self.arena
    }

    pub fn max_jumps(&self) -> Option<u32> {
        self.max_jumps
    }

    pub fn required_input(&self) -> &[(String, DataType)] {
        &self.required_input
    }

    /// Number of top-level steps.
    pub fn len(&self) -> usize {
        self.root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Top-level step at `index`.
    pub fn top_step(&self, index: usize) -> Option<&FlowStep> {
        self.root.get(index).and_then(|id| self.arena.step(*id))
    }

    pub fn top_index(&self, name: &str) -> Option<usize> {
        (0..self.root.len()).find(|i| self.top_step(*i).is_some_and(|s| s.name == name))
    }

    pub fn top_steps(&self) -> impl Iterator<Item = &FlowStep> {
        self.root.iter().filter_map(|id| self.arena.step(*id))
    }

    pub fn step_names(&self) -> Vec<String> {
        self.top_steps().map(|s| s.name.clone()).collect()
    }

    /// Check the blueprint's structure.
    ///
    /// Conditional branch sets without a default are warnings, or errors
    /// when `strict_branching` is set.
    pub fn validate(&self, strict_branching: bool) -> Result<BlueprintReport, EngineError> {
        let mut errors = Vec::new();
        let mut report = BlueprintReport::default();

        if self.root.is_empty() {
            errors.push("flow has no steps".to_string());
        }

        let top_names: Vec<&str> = self.top_steps().map(|s| s.name.as_str()).collect();
        check_unique(&top_names, "top level", &mut errors);
        let top_set: HashSet<&str> = top_names.iter().copied().collect();

        for step in self.top_steps() {
            for dep in &step.dependencies {
                if dep == &step.name {
                    errors.push(format!("step '{}' depends on itself", step.name));
                } else if !top_set.contains(dep.as_str()) {
                    errors.push(format!("step '{}' depends on unknown step '{dep}'", step.name));
                }
            }
            if let Some(target) = &step.jump_to {
                if !top_set.contains(target.as_str()) {
                    errors.push(format!("step '{}' jumps to unknown step '{target}'", step.name));
                }
            }
        }

        for (index, branch) in self.arena.branches.iter().enumerate() {
            let names: Vec<&str> = branch
                .steps
                .iter()
                .filter_map(|id| self.arena.step(*id))
                .map(|s| s.name.as_str())
                .collect();
            check_unique(&names, &format!("branch '{}'", branch.name), &mut errors);

            let local: HashSet<&str> = names.iter().copied().collect();
            for step in branch.steps.iter().filter_map(|id| self.arena.step(*id)) {
                for dep in &step.dependencies {
                    if !local.contains(dep.as_str()) && !top_set.contains(dep.as_str()) {
                        errors.push(format!(
                            "step '{}' in branch '{}' depends on unknown step '{dep}'",
                            step.name, branch.name
                        ));
                    }
                }
                if step.jump_to.is_some() {
                    errors.push(format!(
                        "step '{}' in branch '{}' cannot jump; jumps are top-level only",
                        step.name, branch.name
                    ));
                }
                if step.pause.is_some() {
                    errors.push(format!(
                        "step '{}' in branch '{}' cannot pause; pause gates are top-level only",
                        step.name, branch.name
                    ));
                }
            }

            if !branch.is_default && branch.condition.is_none() {
                errors.push(format!(
                    "branch '{}' (#{index}) is neither default nor conditional",
                    branch.name
                ));
            }
        }

        for step in &self.arena.steps {
            if step.branches.is_empty() {
                continue;
            }
            let defaults = step
                .branches
                .iter()
                .filter_map(|id| self.arena.branch(*id))
                .filter(|b| b.is_default)
                .count();
            if defaults > 1 {
                errors.push(format!("step '{}' declares {defaults} default branches", step.name));
            } else if defaults == 0 {
                let message = format!(
                    "step '{}' has conditional branches but no default; an unmatched run executes no branch",
                    step.name
                );
                if strict_branching {
                    errors.push(message);
                } else {
                    report.warnings.push(message);
                }
            }
        }

        if errors.is_empty() {
            Ok(report)
        } else {
            Err(EngineError::InvalidDefinition {
                flow_type: self.flow_type.clone(),
                reason: errors.join("; "),
            })
        }
    }
}

fn check_unique(names: &[&str], scope: &str, errors: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(*name) {
            errors.push(format!("duplicate step name '{name}' at {scope}"));
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Fluent builder for `FlowBlueprint`.
pub struct FlowBlueprintBuilder {
    flow_type: String,
    root: Vec<StepId>,
    arena: StepArena,
    max_jumps: Option<u32>,
    required_input: Vec<(String, DataType)>,
}

impl FlowBlueprintBuilder {
    pub fn new(flow_type: impl Into<String>) -> Self {
        Self {
            flow_type: flow_type.into(),
            root: Vec::new(),
            arena: StepArena::default(),
            max_jumps: None,
            required_input: Vec::new(),
        }
    }

    /// Append a top-level step (its inline branches are moved into the arena).
    pub fn step(mut self, step: FlowStep) -> Self {
        let id = self.arena.insert(step);
        self.root.push(id);
        self
    }

    /// Append a top-level step together with its static branches.
    pub fn branch_step(self, step: FlowStep, branches: impl IntoIterator<Item = BranchSpec>) -> Self {
        let step = branches.into_iter().fold(step, FlowStep::branch);
        self.step(step)
    }

    /// Per-flow override of the engine's `max_jumps`.
    pub fn max_jumps(mut self, max: u32) -> Self {
        self.max_jumps = Some(max);
        self
    }

    /// Key the initial data must contain, with its type.
    pub fn requires(mut self, key: impl Into<String>, data_type: DataType) -> Self {
        self.required_input.push((key.into(), data_type));
        self
    }

    pub fn build(self) -> FlowBlueprint {
        FlowBlueprint {
            flow_type: self.flow_type,
            root: self.root,
            arena: self.arena,
            max_jumps: self.max_jumps,
            required_input: self.required_input,
        }
    }
}

// ---------------------------------------------------------------------------
// FlowRegistry
// ---------------------------------------------------------------------------

/// Registered blueprints keyed by flow type.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    blueprints: DashMap<String, Arc<FlowBlueprint>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register `blueprint`, replacing an earlier registration
    /// of the same type.
    pub fn register(
        &self,
        blueprint: FlowBlueprint,
        strict_branching: bool,
    ) -> Result<BlueprintReport, EngineError> {
        let report = blueprint.validate(strict_branching)?;
        for warning in &report.warnings {
            tracing::warn!(flow_type = blueprint.flow_type(), "{warning}");
        }
        tracing::info!(
            flow_type = blueprint.flow_type(),
            steps = blueprint.len(),
            "registered flow blueprint"
        );
        self.blueprints
            .insert(blueprint.flow_type.clone(), Arc::new(blueprint));
        Ok(report)
    }

    pub fn get(&self, flow_type: &str) -> Option<Arc<FlowBlueprint>> {
        self.blueprints.get(flow_type).map(|b| Arc::clone(b.value()))
    }

    pub fn contains(&self, flow_type: &str) -> bool {
        self.blueprints.contains_key(flow_type)
    }

    pub fn flow_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.blueprints.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    pub fn unregister(&self, flow_type: &str) -> bool {
        self.blueprints.remove(flow_type).is_some()
    }
}
