//! Bounded retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::config::RetryConfig;
use crate::fleet::transport::TransportError;
use crate::observability::metrics;

/// One attempt of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    /// `None` when the attempt succeeded.
    pub error: Option<String>,
    /// Sleep before the next attempt, if there was one.
    pub delay_ms: Option<u64>,
}

/// Result of a retried operation together with every attempt made.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, TransportError>,
    pub attempts: Vec<Attempt>,
}

impl<T> Retried<T> {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

/// Retry policy for agent operations. Only transient errors are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay after the failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let exponential_base = 2u64.saturating_pow(attempt - 1);
        let delay_ms = self.base_delay_ms.saturating_mul(exponential_base);
        let capped_delay = delay_ms.min(self.max_delay_ms);

        // Jitter: 0 to 10% of the delay
        let jitter_range = capped_delay / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };

        Duration::from_millis(capped_delay + jitter)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, agent_id: &str, mut op: F) -> Retried<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = Vec::new();
        let mut number = 0;

        loop {
            number += 1;
            match op().await {
                Ok(value) => {
                    attempts.push(Attempt {
                        number,
                        error: None,
                        delay_ms: None,
                    });
                    if number > 1 {
                        tracing::info!(agent_id, operation, attempt = number, "Agent operation succeeded after retry");
                    }
                    return Retried {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) => {
                    let retry = e.is_transient() && number < max_attempts;
                    let delay = retry.then(|| self.backoff(number));
                    tracing::warn!(
                        agent_id,
                        operation,
                        attempt = number,
                        max_attempts,
                        error = %e,
                        retry,
                        "Agent operation failed"
                    );
                    attempts.push(Attempt {
                        number,
                        error: Some(e.to_string()),
                        delay_ms: delay.map(|d| d.as_millis() as u64),
                    });
                    match delay {
                        Some(delay) => {
                            metrics::record_retry(operation);
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Retried {
                                result: Err(e),
                                attempts,
                            }
                        }
                    }
                }
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let p = policy();
        assert!(p.backoff(1).as_millis() >= 100);
        assert!(p.backoff(2).as_millis() >= 200);
        let capped = p.backoff(10).as_millis();
        assert!((1000..1100).contains(&capped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let retried = policy()
            .run("push", "a1", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(TransportError::Timeout)
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(retried.result, Ok(3));
        assert_eq!(retried.attempt_count(), 3);
        assert!(retried.attempts[0].delay_ms.is_some());
        assert!(retried.attempts[2].error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_bounded() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let retried: Retried<()> = policy()
            .run("restart", "a1", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Unreachable("refused".into()))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retried.attempt_count(), 3);
        assert!(retried.attempts[2].delay_ms.is_none());
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let retried: Retried<()> = policy()
            .run("push", "a1", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Unauthorized)
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retried.result, Err(TransportError::Unauthorized));
    }
}
