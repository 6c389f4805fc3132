//! Fixed-delay retry policy for step execution.

use std::time::Duration;

use super::handler::StepError;

/// How often, and how far apart, a failed step body is re-invoked.
///
/// `max_retries` counts re-invocations: a policy of 2 allows 3 attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Total number of attempts the policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Stateless retry decisions.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should follow a failed `attempt` (1-based).
    ///
    /// Only retryable errors are retried, and never beyond the policy.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &StepError) -> bool {
        error.is_retryable() && attempt < policy.max_attempts()
    }
}
