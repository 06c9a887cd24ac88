//! ---
//! kormit_section: "02-runtime-integration"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Exponential backoff for transient engine failures."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use kormit_common::RetryConfig;
use kormit_metrics::ReconcilerMetrics;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::Result;

/// Retry schedule applied at the point of use of a runtime call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub base_delay: Duration,
    /// Upper bound for the exponential component.
    pub max_delay: Duration,
    /// Maximum random jitter added on top of each delay.
    pub jitter: Duration,
    metrics: Option<ReconcilerMetrics>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter,
            metrics: None,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.base_delay,
            config.max_delay,
            config.jitter,
        )
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_metrics(mut self, metrics: ReconcilerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Delay inserted after the given (1-indexed) failed attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }

    /// Run `call` until it succeeds, fails definitively, or attempts run out.
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => {
                    self.record(op, true);
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        op,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "engine call failed; retrying"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_retry(op);
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(op, attempt, kind = err.kind(), error = %err, "engine call failed");
                    self.record(op, false);
                    return Err(err);
                }
            }
        }
    }

    fn record(&self, op: &str, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_runtime_op(op, success);
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            4,
            Duration::from_millis(100),
            Duration::from_millis(300),
            Duration::ZERO,
        )
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(300));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_millis(20),
        );
        for _ in 0..50 {
            let delay = policy.backoff_delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(120));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .run("list", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RuntimeError::unavailable("connection refused"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy()
            .run("list", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RuntimeError::unavailable("connection refused"))
            })
            .await;
        assert!(matches!(result, Err(RuntimeError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn definitive_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy()
            .run("create", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RuntimeError::ImageNotFound("ghost:latest".into()))
            })
            .await;
        assert!(matches!(result, Err(RuntimeError::ImageNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
