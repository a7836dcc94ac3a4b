//! Retry strategy - exponential backoff with jitter for version conflicts
//!
//! Only [`Error::VersionConflict`] is retried, and always by rerunning the
//! whole operation. Every other error is returned on the spot.

use crate::config::RetryConfig;
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded retry loop
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    config: RetryConfig,
}

impl RetryStrategy {
    /// Strategy from config
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the nth retry (0-based)
    fn calculate_delay(&self, retry: u32) -> Duration {
        let base_delay = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(retry as i32);

        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        // Jitter spreads out writers that collided on the same account
        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Run `operation` until it succeeds, fails terminally, or runs out of attempts
    ///
    /// Exhaustion is reported as [`Error::Retryable`].
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        operation: F,
        operation_name: &str,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.max_attempts.max(1);

        for attempt in 1..=attempts {
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(
                            operation = operation_name,
                            attempt, "Operation succeeded after version conflict"
                        );
                    }
                    return Ok(result);
                }
                Err(e) if e.is_retryable() => {
                    if attempt == attempts {
                        warn!(
                            operation = operation_name,
                            attempts,
                            error = %e,
                            "Giving up after repeated version conflicts"
                        );
                        break;
                    }
                    let delay = self.calculate_delay(attempt - 1);
                    debug!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Version conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Retryable { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccountId;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_attempts: u32) -> RetryStrategy {
        RetryStrategy::new(RetryConfig {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        })
    }

    #[test]
    fn test_exponential_backoff_with_cap() {
        let strategy = RetryStrategy::new(RetryConfig {
            max_attempts: 10,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        });

        assert_eq!(strategy.calculate_delay(0).as_millis(), 10);
        assert_eq!(strategy.calculate_delay(1).as_millis(), 20);
        assert_eq!(strategy.calculate_delay(2).as_millis(), 40);
        assert_eq!(strategy.calculate_delay(3).as_millis(), 50);
        assert_eq!(strategy.calculate_delay(9).as_millis(), 50);
    }

    #[tokio::test]
    async fn test_retries_conflicts_then_succeeds() {
        let strategy = no_jitter(5);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = strategy
            .execute_with_retry(
                move || async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(Error::VersionConflict("busy".to_string()))
                    } else {
                        Ok(n)
                    }
                },
                "test",
            )
            .await
            .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_retryable() {
        let strategy = no_jitter(3);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = strategy
            .execute_with_retry(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::VersionConflict("busy".to_string()))
                },
                "test",
            )
            .await;

        assert!(matches!(result, Err(Error::Retryable { attempts: 3 })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_business_errors_not_retried() {
        let strategy = no_jitter(5);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = strategy
            .execute_with_retry(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::InsufficientFunds {
                        account: AccountId::new("alice"),
                        required: 800,
                        available: 700,
                    })
                },
                "test",
            )
            .await;

        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
