//! Middleware pipeline wrapped around every step invocation.
//!
//! `before` hooks run in registration order and may refuse the step by
//! returning an error; `after` hooks run in reverse order once the step has
//! resolved (including cache hits). Hooks return boxed futures so the trait
//! stays object-safe and layers can be stored as `Arc<dyn StepMiddleware>`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;

use super::context::FlowExecutionContext;
use super::handler::StepError;

/// Outcome summary handed to `after` hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCompletion {
    pub success: bool,
    pub error: Option<String>,
    pub attempts: u32,
    pub elapsed: Duration,
    pub cached: bool,
}

/// Cross-cutting hook around step execution.
pub trait StepMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    fn before<'a>(
        &'a self,
        _step: &'a str,
        _ctx: &'a FlowExecutionContext,
    ) -> BoxFuture<'a, Result<(), StepError>> {
        Box::pin(async { Ok(()) })
    }

    fn after<'a>(
        &'a self,
        _step: &'a str,
        _ctx: &'a FlowExecutionContext,
        _completion: &'a StepCompletion,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Ordered list of middleware layers.
#[derive(Clone, Default)]
pub struct MiddlewarePipeline {
    layers: Vec<Arc<dyn StepMiddleware>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracing and cancellation guard, the layers every engine runs with.
    pub fn standard() -> Self {
        Self::new()
            .with(Arc::new(TracingMiddleware))
            .with(Arc::new(CancellationGuard))
    }

    pub fn with(mut self, layer: Arc<dyn StepMiddleware>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn push(&mut self, layer: Arc<dyn StepMiddleware>) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    /// Run every `before` hook; the first refusal stops the chain.
    pub async fn before(&self, step: &str, ctx: &FlowExecutionContext) -> Result<(), StepError> {
        for layer in &self.layers {
            if let Err(e) = layer.before(step, ctx).await {
                tracing::debug!(middleware = layer.name(), step, error = %e, "middleware refused step");
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn after(&self, step: &str, ctx: &FlowExecutionContext, completion: &StepCompletion) {
        for layer in self.layers.iter().rev() {
            layer.after(step, ctx, completion).await;
        }
    }
}

impl std::fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("layers", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in layers
// ---------------------------------------------------------------------------

/// Emits structured logs for every step.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

impl StepMiddleware for TracingMiddleware {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn before<'a>(
        &'a self,
        step: &'a str,
        ctx: &'a FlowExecutionContext,
    ) -> BoxFuture<'a, Result<(), StepError>> {
        Box::pin(async move {
            tracing::debug!(
                flow_id = %ctx.flow_id,
                flow_type = ctx.flow_type.as_str(),
                step,
                branch = ctx.branch.as_ref().map(|b| b.branch.as_str()),
                "step starting"
            );
            Ok(())
        })
    }

    fn after<'a>(
        &'a self,
        step: &'a str,
        ctx: &'a FlowExecutionContext,
        completion: &'a StepCompletion,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let elapsed_ms = u64::try_from(completion.elapsed.as_millis()).unwrap_or(u64::MAX);
            if completion.success {
                tracing::debug!(
                    flow_id = %ctx.flow_id,
                    step,
                    attempts = completion.attempts,
                    cached = completion.cached,
                    elapsed_ms,
                    "step succeeded"
                );
            } else {
                tracing::warn!(
                    flow_id = %ctx.flow_id,
                    step,
                    attempts = completion.attempts,
                    error = completion.error.as_deref().unwrap_or("unknown"),
                    elapsed_ms,
                    "step failed"
                );
            }
        })
    }
}

/// Refuses to start a step once the run's cancellation token fired.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancellationGuard;

impl StepMiddleware for CancellationGuard {
    fn name(&self) -> &'static str {
        "cancellation_guard"
    }

    fn before<'a>(
        &'a self,
        _step: &'a str,
        ctx: &'a FlowExecutionContext,
    ) -> BoxFuture<'a, Result<(), StepError>> {
        Box::pin(async move {
            if ctx.is_cancelled() {
                Err(StepError::Cancelled)
            } else {
                Ok(())
            }
        })
    }
}

/// Per-step counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepMetrics {
    pub invocations: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub attempts: u64,
    pub total_duration: Duration,
}

/// Collects `StepMetrics` keyed by `"{flow_type}.{step}"`.
#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    metrics: DashMap<String, StepMetrics>,
}

impl MetricsMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, StepMetrics> {
        self.metrics
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn get(&self, flow_type: &str, step: &str) -> Option<StepMetrics> {
        self.metrics.get(&format!("{flow_type}.{step}")).map(|m| *m)
    }
}

impl StepMiddleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn after<'a>(
        &'a self,
        step: &'a str,
        ctx: &'a FlowExecutionContext,
        completion: &'a StepCompletion,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut entry = self
                .metrics
                .entry(format!("{}.{step}", ctx.flow_type))
                .or_default();
            entry.invocations += 1;
            entry.attempts += u64::from(completion.attempts);
            entry.total_duration += completion.elapsed;
            if completion.cached {
                entry.cache_hits += 1;
            }
            if !completion.success {
                entry.failures += 1;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl StepMiddleware for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        fn before<'a>(
            &'a self,
            step: &'a str,
            _ctx: &'a FlowExecutionContext,
        ) -> BoxFuture<'a, Result<(), StepError>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("before:{}:{step}", self.label));
                Ok(())
            })
        }

        fn after<'a>(
            &'a self,
            step: &'a str,
            _ctx: &'a FlowExecutionContext,
            _completion: &'a StepCompletion,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("after:{}:{step}", self.label));
            })
        }
    }

    fn completion(success: bool) -> StepCompletion {
        StepCompletion {
            success,
            error: (!success).then(|| "boom".to_string()),
            attempts: 2,
            elapsed: Duration::from_millis(30),
            cached: false,
        }
    }

    #[tokio::test]
    async fn hooks_run_in_order_and_unwind_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new()
            .with(Arc::new(Recorder { label: "a", log: Arc::clone(&log) }))
            .with(Arc::new(Recorder { label: "b", log: Arc::clone(&log) }));
        let ctx = FlowExecutionContext::detached("order", "alice");

        pipeline.before("charge", &ctx).await.unwrap();
        pipeline.after("charge", &ctx, &completion(true)).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:a:charge", "before:b:charge", "after:b:charge", "after:a:charge"]
        );
    }

    #[tokio::test]
    async fn cancellation_guard_refuses_cancelled_runs() {
        let pipeline = MiddlewarePipeline::standard();
        let ctx = FlowExecutionContext::detached("order", "alice");
        assert!(pipeline.before("charge", &ctx).await.is_ok());
        ctx.cancellation().cancel();
        assert_eq!(pipeline.before("charge", &ctx).await, Err(StepError::Cancelled));
    }

    #[tokio::test]
    async fn metrics_accumulate_per_step() {
        let metrics = Arc::new(MetricsMiddleware::new());
        let pipeline = MiddlewarePipeline::new().with(metrics.clone());
        let ctx = FlowExecutionContext::detached("order", "alice");

        pipeline.after("charge", &ctx, &completion(true)).await;
        pipeline.after("charge", &ctx, &completion(false)).await;

        let m = metrics.get("order", "charge").unwrap();
        assert_eq!(m.invocations, 2);
        assert_eq!(m.failures, 1);
        assert_eq!(m.attempts, 4);
        assert_eq!(m.total_duration, Duration::from_millis(60));
        assert_eq!(metrics.snapshot().len(), 1);
    }
}
