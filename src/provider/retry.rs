//! Bounded retry with exponential backoff and jitter.
//!
//! Only throttling and transient provider failures are retried. Every other
//! error is returned on the first attempt so callers see NotFound, conflicts
//! and invariant violations unchanged.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::error::{ConvergeError, ProviderError, ReconcileError, Result};

/// Retry policy applied at each provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// First backoff delay.
    pub initial_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Creates a policy with the given attempts and a fixed tiny delay.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// the attempts are used up.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error unchanged, or
    /// `ReconcileError::RetriesExhausted` carrying the last error's text.
    pub async fn run<F, Fut, T>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_backoff(self, operation, op).await
    }

    /// Applies jitter to `base`, then caps the result at `max_delay`.
    fn jittered_delay(&self, base: Duration) -> Duration {
        let jitter = rand::rng().random_range(0.5..1.5);
        Duration::from_secs_f64(base.as_secs_f64() * jitter).min(self.max_delay)
    }

    fn next_delay(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(
            (current.as_secs_f64() * self.multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Executes an async provider call with exponential backoff and jitter.
///
/// # Errors
///
/// See [`RetryPolicy::run`].
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };

        if attempt >= policy.max_attempts {
            error!(
                operation = %operation,
                attempt = attempt,
                error = %err,
                "Provider call failed after max retries"
            );
            return Err(ConvergeError::Reconcile(ReconcileError::RetriesExhausted {
                attempts: attempt,
                operation: operation.to_string(),
                last_error: err.to_string(),
            }));
        }

        // Throttling hints win over the computed backoff, still capped.
        let hinted = match err.provider_error() {
            Some(ProviderError::Throttled { retry_after_secs }) => {
                Duration::from_secs(*retry_after_secs)
            }
            _ => Duration::ZERO,
        };
        let jittered = policy.jittered_delay(delay.max(hinted));

        warn!(
            operation = %operation,
            attempt = attempt,
            error = %err,
            delay_ms = jittered.as_millis(),
            "Provider call failed, retrying"
        );

        tokio::time::sleep(jittered).await;
        delay = policy.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_jittered_delay_never_exceeds_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
        };

        for _ in 0..200 {
            assert!(policy.jittered_delay(Duration::from_millis(400)) <= policy.max_delay);
            assert!(policy.jittered_delay(Duration::from_secs(30)) <= policy.max_delay);
            assert!(policy.jittered_delay(Duration::from_millis(100)) >= Duration::from_millis(49));
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result = RetryPolicy::immediate(3)
            .run("op", || async { Ok::<_, ConvergeError>(42) })
            .await;
        assert_eq!(result.expect("ok"), 42);
    }

    #[tokio::test]
    async fn test_throttling_absorbed() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);

        let result = RetryPolicy::immediate(5)
            .run("DescribeLaunchTemplates", || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProviderError::transient("rate exceeded").into())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.expect("ok"), "done");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_first_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);

        let result: Result<()> = RetryPolicy::immediate(5)
            .run("DeleteLaunchTemplateVersions", || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::not_found("launch template", "lt-1").into())
                }
            })
            .await;

        assert!(result.expect_err("should fail").is_not_found());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_is_transient_but_final() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);

        let result: Result<()> = RetryPolicy::immediate(3)
            .run("CreateTags", || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::transient("503").into())
                }
            })
            .await;

        let err = result.expect_err("should fail");
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("CreateTags"));
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RetryPolicy::from(&RetryConfig {
            max_attempts: 0,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 3.0,
        });

        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.next_delay(Duration::from_millis(100)).as_millis(), 300);
        assert_eq!(policy.next_delay(Duration::from_millis(900)), Duration::from_secs(1));
    }
}
