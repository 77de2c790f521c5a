//! Resilience primitives wrapped around job runs.
//!
//! Composition order is retry → circuit breaker → bulkhead → rate limiter,
//! outermost to innermost. The retry executor re-runs only the wrapped
//! action; fast-fail sentinels from the breaker and bulkhead are final.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::metrics::MetricsRecorder;
use crate::types::{CancelToken, JobError, ResilienceError};

pub mod bulkhead;
pub mod circuit_breaker;
pub mod rate_limiter;

pub use bulkhead::{Bulkhead, BulkheadConfig};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};

/// Per-job retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first; `0` disables retrying.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default)]
    pub exponential: bool,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter: bool,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: default_initial_delay_ms(),
            exponential: false,
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
        }
    }
}

/// Backoff before the attempt after `attempt` (0-based) failed:
/// the fixed initial delay, or `min(initial × 2^attempt, max)` when
/// exponential.
pub fn calculate_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = if policy.exponential {
        let factor = 2u64.saturating_pow(attempt);
        policy
            .initial_delay_ms
            .saturating_mul(factor)
            .min(policy.max_delay_ms)
    } else {
        policy.initial_delay_ms
    };

    let millis = if policy.jitter && base > 0 {
        base + rand::thread_rng().gen_range(0..=base / 10)
    } else {
        base
    };
    Duration::from_millis(millis)
}

/// An attempt factory: called once per retry attempt.
pub type Attempt<'a> = Box<dyn FnMut() -> BoxFuture<'a, Result<(), JobError>> + Send + 'a>;

/// Drives an action through the job's retry policy.
pub struct RetryExecutor {
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl RetryExecutor {
    pub fn new(clock: Arc<dyn Clock>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self { clock, metrics }
    }

    /// Run `action` up to `max_retries + 1` times. Non-retryable errors and
    /// cancellation end the loop early; exhaustion wraps the last error.
    pub async fn execute(
        &self,
        job_name: &str,
        policy: &RetryPolicy,
        cancel: &CancelToken,
        mut action: Attempt<'_>,
    ) -> Result<(), JobError> {
        if policy.max_retries == 0 {
            return action().await;
        }

        let total_attempts = policy.max_retries + 1;
        let mut attempt: u32 = 0;
        loop {
            match action().await {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::info!(
                            job = job_name,
                            attempt = attempt + 1,
                            "job succeeded after retry"
                        );
                        self.metrics.job_retry(job_name, attempt + 1, true);
                    }
                    return Ok(());
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    if attempt < policy.max_retries {
                        tracing::warn!(
                            job = job_name,
                            error = %err,
                            "job failed, attempt {}/{}",
                            attempt + 1,
                            total_attempts
                        );
                        self.metrics.job_retry(job_name, attempt + 1, false);

                        let delay = calculate_delay(policy, attempt);
                        tokio::select! {
                            _ = self.clock.sleep(delay) => {}
                            _ = cancel.cancelled() => return Err(JobError::Canceled),
                        }
                        attempt += 1;
                    } else {
                        tracing::error!(
                            job = job_name,
                            error = %err,
                            "job failed after {} retries",
                            total_attempts
                        );
                        self.metrics.job_retry(job_name, total_attempts, false);
                        return Err(JobError::RetriesExhausted {
                            attempts: total_attempts,
                            source: Box::new(err),
                        });
                    }
                }
            }
        }
    }
}

/// Optional breaker/bulkhead/rate-limiter configuration shared by all jobs
/// dispatched through one scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub bulkhead: Option<BulkheadConfig>,
    pub rate_limiter: Option<RateLimiterConfig>,
}

/// The assembled resilience stack below the retry executor.
pub struct ResilienceChain {
    breaker: Option<Arc<CircuitBreaker>>,
    bulkhead: Option<Arc<Bulkhead>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl ResilienceChain {
    pub fn new(config: &ResilienceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breaker: config
                .circuit_breaker
                .clone()
                .map(|c| Arc::new(CircuitBreaker::new(c, Arc::clone(&clock)))),
            bulkhead: config
                .bulkhead
                .clone()
                .map(|c| Arc::new(Bulkhead::new(c))),
            limiter: config
                .rate_limiter
                .clone()
                .map(|c| Arc::new(RateLimiter::new(c, Arc::clone(&clock)))),
        }
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Run one attempt through breaker → bulkhead → rate limiter.
    ///
    /// Resilience rejections never feed the breaker's failure counter; only
    /// real action outcomes do. A skip sentinel counts as success.
    pub async fn run_attempt(
        &self,
        action: BoxFuture<'_, Result<(), JobError>>,
    ) -> Result<(), JobError> {
        let breaker_permit = match &self.breaker {
            Some(breaker) => Some(breaker.acquire()?),
            None => None,
        };

        let _bulkhead_permit = match &self.bulkhead {
            Some(bulkhead) => match bulkhead.try_acquire() {
                Ok(permit) => Some(permit),
                Err(err) => {
                    if let Some(permit) = breaker_permit {
                        permit.abandon();
                    }
                    return Err(err.into());
                }
            },
            None => None,
        };

        if let Some(limiter) = &self.limiter {
            if !limiter.allow() {
                if let Some(permit) = breaker_permit {
                    permit.abandon();
                }
                return Err(ResilienceError::RateLimitExceeded.into());
            }
        }

        let result = action.await;

        if let Some(permit) = breaker_permit {
            let success = matches!(result, Ok(()) | Err(JobError::Skipped));
            permit.record(success);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::metrics::MemoryRecorder;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fail_n_times(n: u32) -> (Attempt<'static>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let action: Attempt<'static> = Box::new(move || {
            let calls = counter.clone();
            Box::pin(async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                if attempt < n {
                    Err(JobError::NonZeroExit { code: 1 })
                } else {
                    Ok(())
                }
            })
        });
        (action, calls)
    }

    #[test]
    fn fixed_delay_ignores_attempt_number() {
        let policy = RetryPolicy {
            initial_delay_ms: 10,
            exponential: false,
            ..RetryPolicy::default()
        };
        assert_eq!(calculate_delay(&policy, 0), Duration::from_millis(10));
        assert_eq!(calculate_delay(&policy, 5), Duration::from_millis(10));
    }

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_delay_ms: 10,
            exponential: true,
            max_delay_ms: 80,
            ..RetryPolicy::default()
        };
        assert_eq!(calculate_delay(&policy, 0), Duration::from_millis(10));
        assert_eq!(calculate_delay(&policy, 1), Duration::from_millis(20));
        assert_eq!(calculate_delay(&policy, 2), Duration::from_millis(40));
        assert_eq!(calculate_delay(&policy, 3), Duration::from_millis(80));
        assert_eq!(calculate_delay(&policy, 10), Duration::from_millis(80));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy {
            initial_delay_ms: 100,
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = calculate_delay(&policy, 0).as_millis() as u64;
            assert!((100..=110).contains(&d));
        }
    }

    #[tokio::test]
    async fn zero_max_retries_invokes_exactly_once() {
        let executor = RetryExecutor::new(Arc::new(SystemClock), Arc::new(MemoryRecorder::new()));
        let (action, calls) = fail_n_times(5);
        let result = executor
            .execute("once", &RetryPolicy::default(), &CancelToken::new(), action)
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_on_first_attempt_records_no_retry_metric() {
        let metrics = Arc::new(MemoryRecorder::new());
        let executor = RetryExecutor::new(Arc::new(SystemClock), metrics.clone());
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1,
            ..RetryPolicy::default()
        };
        let (action, calls) = fail_n_times(0);
        executor
            .execute("first", &policy, &CancelToken::new(), action)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(metrics.retries("first").is_empty());
    }

    #[tokio::test]
    async fn retries_until_success_and_records_attempt_number() {
        let clock = Arc::new(ManualClock::default_epoch());
        let metrics = Arc::new(MemoryRecorder::new());
        let executor = RetryExecutor::new(clock.clone(), metrics.clone());
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 10,
            exponential: true,
            max_delay_ms: 80,
            ..RetryPolicy::default()
        };

        let (action, calls) = fail_n_times(3);
        let cancel = CancelToken::new();
        let task = tokio::spawn(async move {
            executor.execute("backoff", &policy, &cancel, action).await
        });

        // Drive the three backoff sleeps: 10, 20, 40 ms.
        for _ in 0..3 {
            for _ in 0..50 {
                tokio::task::yield_now().await;
            }
            clock.advance(Duration::from_millis(40));
        }

        let result = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let retries = metrics.retries("backoff");
        assert_eq!(retries.len(), 4);
        assert_eq!(retries[0], (1, false));
        assert_eq!(retries[1], (2, false));
        assert_eq!(retries[2], (3, false));
        assert_eq!(retries[3], (4, true));
    }

    #[tokio::test]
    async fn exhaustion_wraps_the_final_error() {
        let clock = Arc::new(ManualClock::default_epoch());
        let metrics = Arc::new(MemoryRecorder::new());
        let executor = RetryExecutor::new(clock.clone(), metrics.clone());
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 10,
            exponential: true,
            max_delay_ms: 80,
            ..RetryPolicy::default()
        };

        let (action, calls) = fail_n_times(100);
        let cancel = CancelToken::new();
        let task = tokio::spawn(async move {
            executor.execute("doomed", &policy, &cancel, action).await
        });
        for _ in 0..3 {
            for _ in 0..50 {
                tokio::task::yield_now().await;
            }
            clock.advance(Duration::from_millis(40));
        }

        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("failed after 4 attempts"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let retries = metrics.retries("doomed");
        assert_eq!(retries.last(), Some(&(4, false)));
    }

    #[tokio::test]
    async fn breaker_sentinel_is_not_retried() {
        let executor = RetryExecutor::new(Arc::new(SystemClock), Arc::new(MemoryRecorder::new()));
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay_ms: 1,
            ..RetryPolicy::default()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let action: Attempt<'static> = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(JobError::Resilience(ResilienceError::CircuitOpen)) })
        });

        let err = executor
            .execute("gated", &policy, &CancelToken::new(), action)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::Resilience(ResilienceError::CircuitOpen)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let clock = Arc::new(ManualClock::default_epoch());
        let executor = RetryExecutor::new(clock.clone(), Arc::new(MemoryRecorder::new()));
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay_ms: 10_000,
            ..RetryPolicy::default()
        };

        let (action, _calls) = fail_n_times(100);
        let cancel = CancelToken::new();
        let cancel_clone = cancel.clone();
        let task =
            tokio::spawn(
                async move { executor.execute("slow", &policy, &cancel, action).await },
            );
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        cancel_clone.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, JobError::Canceled));
    }

    #[tokio::test]
    async fn chain_without_components_just_runs_the_action() {
        let chain = ResilienceChain::new(&ResilienceConfig::default(), Arc::new(SystemClock));
        let result = chain.run_attempt(Box::pin(async { Ok(()) })).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn chain_rate_limit_rejection_does_not_trip_breaker() {
        let config = ResilienceConfig {
            circuit_breaker: Some(CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            }),
            rate_limiter: Some(RateLimiterConfig {
                capacity: 1,
                refill_per_second: 0.0,
            }),
            ..ResilienceConfig::default()
        };
        let chain = ResilienceChain::new(&config, Arc::new(SystemClock));

        // First call consumes the only token.
        chain
            .run_attempt(Box::pin(async { Ok(()) }))
            .await
            .unwrap();

        // Second call is rate-limited, but the breaker must stay closed.
        let err = chain
            .run_attempt(Box::pin(async { Ok(()) }))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::Resilience(ResilienceError::RateLimitExceeded)
        ));
        assert_eq!(
            chain.breaker().unwrap().state(),
            CircuitState::Closed
        );
    }
}
