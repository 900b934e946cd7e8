//! Retry policies and their executor.
//!
//! `RetryPolicy` is the declarative part (how many attempts, how long to wait,
//! for how long overall). `Retry` binds a policy to the predicates that decide
//! which outcomes deserve another attempt, and runs an operation under it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, first one included (`None` = unbounded)
    pub max_attempts: Option<u32>,
    /// Delay after the first failed attempt; lower bound of every delay
    pub base_delay: Duration,
    /// Upper bound of every delay
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0); never pushes a delay outside the bounds
    pub jitter: f64,
    /// Stop retrying once this much time has passed since the first attempt
    pub max_duration: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
            max_duration: None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
            max_duration: None,
        }
    }

    /// Create a policy with exponential backoff between `base_delay` and `max_delay`.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            base_delay,
            max_delay: max_delay.max(base_delay),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
            max_duration: None,
        }
    }

    /// Unbounded attempts at a fixed pace, until `max_duration` has elapsed.
    pub fn until(max_duration: Duration, delay: Duration) -> Self {
        Self {
            max_attempts: None,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
            max_duration: Some(max_duration),
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    /// Calculate delay after a given attempt number (1-indexed).
    ///
    /// The result always lies within `[base_delay, max_delay]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = (self.max_delay.as_millis() as f64).max(base_ms);

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic "jitter" derived from the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(base_ms, max_ms) as u64)
    }

    /// Whether another attempt may start after `attempts_made` attempts and
    /// `elapsed` time since the first one.
    pub fn allows_another(&self, attempts_made: u32, elapsed: Duration) -> bool {
        let attempts_left = self.max_attempts.is_none_or(|max| attempts_made < max);
        let time_left = self.max_duration.is_none_or(|max| elapsed < max);
        attempts_left && time_left
    }
}

type Predicate<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

/// How an execution under a [`Retry`] went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStats {
    pub attempts: u32,
    pub elapsed: Duration,
    /// The last outcome still asked for a retry but the budget was spent.
    pub exhausted: bool,
    pub cancelled: bool,
}

/// An executable retry policy over operations producing `Result<T, E>`.
///
/// Outcomes not matched by a predicate are returned immediately. When the
/// budget runs out, the last outcome is returned unchanged.
pub struct Retry<T, E> {
    name: &'static str,
    policy: RetryPolicy,
    retry_on_result: Option<Predicate<T>>,
    retry_on_error: Option<Predicate<E>>,
    cancel: Option<CancellationToken>,
}

impl<T, E> Clone for Retry<T, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            policy: self.policy.clone(),
            retry_on_result: self.retry_on_result.clone(),
            retry_on_error: self.retry_on_error.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Retry<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("retry_on_result", &self.retry_on_result.is_some())
            .field("retry_on_error", &self.retry_on_error.is_some())
            .finish()
    }
}

impl<T, E> Retry<T, E>
where
    T: fmt::Debug,
    E: fmt::Display,
{
    /// `name` labels log lines emitted by this policy.
    pub fn new(name: &'static str, policy: RetryPolicy) -> Self {
        Self {
            name,
            policy,
            retry_on_result: None,
            retry_on_error: None,
            cancel: None,
        }
    }

    /// Retry when a successful outcome satisfies `predicate`.
    pub fn retry_if_result<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.retry_on_result = Some(Arc::new(predicate));
        self
    }

    /// Retry when a failure satisfies `predicate`. Without one, every failure
    /// propagates on first sight.
    pub fn retry_if_error<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_on_error = Some(Arc::new(predicate));
        self
    }

    /// Abandon backoff waits once `token` is cancelled.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn wants_retry(&self, outcome: &Result<T, E>) -> bool {
        match outcome {
            Ok(value) => self.retry_on_result.as_ref().is_some_and(|p| p(value)),
            Err(err) => self.retry_on_error.as_ref().is_some_and(|p| p(err)),
        }
    }

    /// Run `op` until it yields an outcome no predicate matches, or the
    /// policy gives up.
    pub async fn execute<F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_stats(op).await.0
    }

    /// Like [`Retry::execute`], also reporting how the execution went.
    pub async fn execute_with_stats<F, Fut>(&self, op: F) -> (Result<T, E>, RetryStats)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            let outcome = op().await;
            let elapsed = started.elapsed();
            let mut stats = RetryStats {
                attempts: attempt,
                elapsed,
                exhausted: false,
                cancelled: false,
            };

            if !self.wants_retry(&outcome) {
                if attempt > 1 {
                    debug!(
                        policy = self.name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "operation settled after retries"
                    );
                }
                return (outcome, stats);
            }

            if !self.policy.allows_another(attempt, elapsed) {
                stats.exhausted = true;
                match &outcome {
                    Ok(value) => warn!(
                        policy = self.name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        last_result = ?value,
                        "retries exhausted"
                    ),
                    Err(err) => warn!(
                        policy = self.name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        error = %err,
                        "retries exhausted"
                    ),
                }
                return (outcome, stats);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            match &outcome {
                Ok(value) => trace!(
                    policy = self.name,
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    delay_ms = delay.as_millis() as u64,
                    last_result = ?value,
                    "attempt needs a retry"
                ),
                Err(err) => trace!(
                    policy = self.name,
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, retrying"
                ),
            }

            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!(policy = self.name, attempt, "cancelled while backing off");
                            stats.cancelled = true;
                            return (outcome, stats);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Run `op` under `inner` for every attempt `self` makes.
    ///
    /// An outcome that exhausts `inner` counts as a single attempt here.
    pub async fn execute_nested<F, Fut>(&self, inner: &Retry<T, E>, op: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let op = &op;
        self.execute(move || inner.execute(op)).await
    }
}
