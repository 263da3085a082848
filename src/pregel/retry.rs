//! Per-task retry policy.

use std::time::Duration;

use rand::Rng;

use crate::node::NodeError;

/// Which error kinds a retry policy applies to.
///
/// Kinds are the stable names returned by [`NodeError::kind`]. Control-flow
/// signals (interrupts, cancellation) are never retried regardless of the
/// policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryOn {
    /// Retry every failure.
    All,
    /// Retry only the named error kinds.
    Kinds(Vec<String>),
}

/// Exponential backoff retry policy for a node's task executions.
///
/// Retries replay the same deterministic task id, so the saver's
/// `put_writes` idempotence guarantees a retried task cannot double-commit.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    /// Randomize each interval by ±20% to decorrelate retry storms.
    pub jitter: bool,
    pub retry_on: RetryOn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(30),
            jitter: true,
            retry_on: RetryOn::All,
        }
    }
}

impl RetryPolicy {
    /// Policy retrying up to `max_attempts` total attempts.
    #[must_use]
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    #[must_use]
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Retry only the named [`NodeError::kind`]s.
    #[must_use]
    pub fn on_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry_on = RetryOn::Kinds(kinds.into_iter().map(Into::into).collect());
        self
    }

    /// Whether `error` should be retried after `attempt` completed
    /// attempts.
    #[must_use]
    pub fn should_retry(&self, error: &NodeError, attempt: u32) -> bool {
        if error.is_control_flow() || attempt >= self.max_attempts {
            return false;
        }
        match &self.retry_on {
            RetryOn::All => true,
            RetryOn::Kinds(kinds) => kinds.iter().any(|k| k == error.kind()),
        }
    }

    /// Backoff before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base = self.initial_interval.as_secs_f64() * self.backoff_factor.powi(exponent as i32);
        let capped = base.min(self.max_interval.as_secs_f64());
        let secs = if self.jitter {
            capped * rand::rng().random_range(0.8..1.2)
        } else {
            capped
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}
