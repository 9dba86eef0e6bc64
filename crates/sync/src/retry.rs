//! Retry with exponential backoff for ledger calls
//!
//! Every attempt runs under a deadline. Transient failures and timeouts are
//! retried with `initial_backoff * multiplier^(attempt-1)` capped at
//! `max_backoff`, plus up to 25% random jitter (still capped). Contract
//! rejections return immediately. Running out of attempts yields
//! `LedgerUnreachable` carrying the attempt count and the last error.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};
use votechain_core::config::SyncConfig;
use votechain_core::{ElectionError, Result};
use votechain_ledger::{ChainError, ChainResult};

/// Retry budget and deadlines for ledger calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per call, including the first (at least 1)
    pub max_attempts: u32,
    /// Deadline for a single attempt
    pub rpc_timeout: Duration,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            rpc_timeout: Duration::from_secs(10),
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            rpc_timeout: Duration::from_millis(config.rpc_timeout_ms),
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
            jitter: true,
        }
    }

    /// Delay before retry number `attempt` (1-indexed), without jitter.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let max = self.max_backoff_ms as f64;
        if raw.is_nan() || raw < 0.0 {
            0
        } else if raw > max {
            self.max_backoff_ms
        } else {
            raw as u64
        }
    }

    /// Delay before retry number `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.base_delay_ms(attempt);
        if self.jitter {
            let quarter = delay / 4;
            if quarter > 0 {
                delay = delay
                    .saturating_add(rand::thread_rng().gen_range(0..=quarter))
                    .min(self.max_backoff_ms);
            }
        }
        Duration::from_millis(delay)
    }

    /// Run `call` until it succeeds, is rejected, or the budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ChainResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let last_error = match tokio::time::timeout(self.rpc_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(ChainError::Rejected(rejection))) => {
                    warn!(operation, %rejection, "Ledger rejected call");
                    return Err(rejection.into());
                }
                Ok(Err(ChainError::Unavailable(reason))) => {
                    error!(operation, attempt, reason = %reason, "Ledger unavailable");
                    return Err(ElectionError::LedgerUnreachable {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last_error: reason,
                    });
                }
                Ok(Err(ChainError::Transient(reason))) => reason,
                Err(_) => format!("timed out after {} ms", self.rpc_timeout.as_millis()),
            };

            if attempt >= max_attempts {
                error!(
                    operation,
                    attempts = attempt,
                    last_error = %last_error,
                    "Ledger call failed, retry budget exhausted"
                );
                return Err(ElectionError::LedgerUnreachable {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error,
                });
            }

            let delay = self.delay(attempt);
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "Ledger call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use votechain_core::ErrorKind;
    use votechain_ledger::ContractError;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            rpc_timeout: Duration::from_millis(50),
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            jitter: false,
            ..RetryPolicy::default()
        };
        let delays: Vec<u64> = (1..=6).map(|a| policy.base_delay_ms(a)).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let value = fast_policy(3)
            .run("getElection", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ChainError::Transient("connection reset".into()))
                    } else {
                        Ok(7u32)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(3)
            .run("createElection", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ChainError::Transient("node down".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            ElectionError::LedgerUnreachable {
                operation,
                attempts,
                last_error,
            } => {
                assert_eq!(operation, "createElection");
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "node down");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeouts_are_retried() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(2)
            .run("getElection", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<(), ChainError>(())
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.kind(), ErrorKind::LedgerUnreachable);
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(5)
            .run("createElection", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(ChainError::Rejected(ContractError::ElectionExists("e1".into())))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_cap(
            initial in 0u64..10_000,
            extra in 0u64..100_000,
            multiplier in 1.0f64..10.0,
            attempt in 1u32..200,
        ) {
            let policy = RetryPolicy {
                initial_backoff_ms: initial,
                max_backoff_ms: initial + extra,
                backoff_multiplier: multiplier,
                jitter: true,
                ..RetryPolicy::default()
            };
            prop_assert!(policy.delay(attempt) <= Duration::from_millis(initial + extra));
        }
    }
}
