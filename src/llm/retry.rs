//! Capped exponential backoff for provider calls.

use super::ProviderError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// Result of a retried call and the number of attempts made.
pub struct Attempted<T> {
    pub result: Result<T, ProviderError>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(format!("retry.multiplier must be >= 1, got {}", self.multiplier));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("retry.initial_backoff_ms exceeds retry.max_backoff_ms".to_string());
        }
        Ok(())
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = (self.initial_backoff_ms as f64) * self.multiplier.powi(exp);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }

    fn delay_after(&self, attempt: u32, err: &ProviderError) -> Duration {
        let cap = Duration::from_millis(self.max_backoff_ms);
        match err {
            ProviderError::RateLimited {
                retry_after: Some(hint),
            } => (*hint).min(cap),
            _ => self.backoff_for(attempt),
        }
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts,
    /// or `cancel` fires during a backoff.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= max {
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                };
            }

            let delay = self.delay_after(attempt, &err);
            warn!(attempt, max_attempts = max, ?delay, error = %err, "provider call failed, retrying");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Attempted { result: Err(err), attempts: attempt };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(10), Duration::from_millis(10_000));
    }

    #[test]
    fn test_rate_limit_hint_capped() {
        let policy = RetryPolicy::default();
        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(120)),
        };
        assert_eq!(policy.delay_after(1, &err), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = fast()
            .run(&CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProviderError::Timeout)
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(out.result.unwrap(), 7);
        assert_eq!(out.attempts, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let out: Attempted<()> = fast()
            .run(&CancellationToken::new(), || async { Err(ProviderError::Timeout) })
            .await;
        assert!(matches!(out.result, Err(ProviderError::Timeout)));
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let out: Attempted<()> = fast()
            .run(&CancellationToken::new(), || async {
                Err(ProviderError::InvalidResponse("garbage".into()))
            })
            .await;
        assert_eq!(out.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy {
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            ..fast()
        };
        let out: Attempted<()> = policy
            .run(&cancel, || async { Err(ProviderError::Unavailable("down".into())) })
            .await;
        assert_eq!(out.attempts, 1);
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy { max_attempts: 0, ..RetryPolicy::default() }.validate().is_err());
    }
}
