//! Timeout + bounded exponential backoff around a port call.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{PortError, PortKind, PortResult};
use crate::config::RetryConfig;
use crate::error::ParleyError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn base_backoff(&self, retry: u32) -> Duration {
        let exp = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let ms = (self.initial_backoff.as_millis() as f64 * exp)
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }

    fn jittered_backoff(&self, retry: u32) -> Duration {
        let base = self.base_backoff(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + spread).max(0.0)).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Why a retried call produced no value.
#[derive(Debug)]
pub enum CallError {
    /// The turn was cancelled (barge-in or shutdown). Not an error.
    Cancelled,
    /// Retries exhausted or a permanent failure: `PortTimeout` / `PortFailure`.
    Failed(ParleyError),
}

/// Run `op` with a per-attempt `timeout`, retrying transient failures.
///
/// Cancellation wins over everything: it is checked before each attempt,
/// raced against each attempt and against each backoff sleep.
pub async fn call_with_retry<T, F, Fut>(
    port: PortKind,
    policy: &RetryPolicy,
    timeout: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PortResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CallError::Cancelled),
            r = tokio::time::timeout(timeout, op()) => r.unwrap_or(Err(PortError::Timeout)),
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(%port, attempt, "port call succeeded after retry");
                }
                return Ok(value);
            }
            Err(PortError::Cancelled) if cancel.is_cancelled() => {
                return Err(CallError::Cancelled);
            }
            Err(err) => err,
        };

        if err.is_retryable() && attempt < policy.max_attempts {
            let delay = policy.jittered_backoff(attempt);
            warn!(
                %port,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "port call failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            continue;
        }

        let failure = match err {
            PortError::Timeout => ParleyError::PortTimeout {
                port,
                attempts: attempt,
            },
            other => ParleyError::PortFailure {
                port,
                attempts: attempt,
                reason: other.to_string(),
            },
        };
        return Err(CallError::Failed(failure));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.base_backoff(1), Duration::from_millis(100));
        assert_eq!(policy.base_backoff(2), Duration::from_millis(200));
        assert_eq!(policy.base_backoff(3), Duration::from_millis(400));
        assert_eq!(policy.base_backoff(4), Duration::from_millis(500));
        assert_eq!(policy.jittered_backoff(9), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_cap() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..fast_policy(3)
        };
        for retry in 1..8 {
            assert!(policy.jittered_backoff(retry) <= policy.max_backoff);
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let c = Arc::clone(&calls);
        let out = call_with_retry(
            PortKind::Generation,
            &fast_policy(3),
            Duration::from_secs(1),
            &cancel,
            move || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(PortError::Transient("503".into()))
                    } else {
                        Ok("ok")
                    }
                }
            },
        )
        .await;
        assert_eq!(out.ok(), Some("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_port_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let c = Arc::clone(&calls);
        let out: Result<(), _> = call_with_retry(
            PortKind::Transcription,
            &fast_policy(3),
            Duration::from_secs(1),
            &cancel,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(PortError::Transient("reset".into())) }
            },
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match out {
            Err(CallError::Failed(ParleyError::PortFailure { port, attempts, .. })) => {
                assert_eq!(port, PortKind::Transcription);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected PortFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let c = Arc::clone(&calls);
        let out: Result<(), _> = call_with_retry(
            PortKind::Synthesis,
            &fast_policy(5),
            Duration::from_secs(1),
            &cancel,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(PortError::Permanent("401".into())) }
            },
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            out,
            Err(CallError::Failed(ParleyError::PortFailure { attempts: 1, .. }))
        ));
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let cancel = CancellationToken::new();
        let out: Result<(), _> = call_with_retry(
            PortKind::Generation,
            &fast_policy(2),
            Duration::from_millis(10),
            &cancel,
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(
            out,
            Err(CallError::Failed(ParleyError::PortTimeout { attempts: 2, .. }))
        ));
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let out: Result<(), _> = call_with_retry(
            PortKind::Generation,
            &fast_policy(3),
            Duration::from_secs(10),
            &cancel,
            || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(out, Err(CallError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
