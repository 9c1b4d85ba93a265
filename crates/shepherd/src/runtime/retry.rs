//! Exponential backoff around the (start, health check) unit.
//!
//! A start that succeeds but never becomes healthy consumes a retry
//! attempt exactly like a failed spawn: both trigger the same backoff
//! and re-spawn path.

use std::future::Future;
use std::time::Duration;

use crate::error::ServiceError;

/// Backoff parameters for retried service starts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first (total attempts = max_retries + 1).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }
}

/// Delay before re-attempting after failed attempt `attempt` (0-based):
/// `min(base * factor^attempt, max_delay)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let scaled = policy.base_delay.as_secs_f64() * policy.backoff_factor.powi(attempt as i32);
    Duration::from_secs_f64(scaled.min(policy.max_delay.as_secs_f64()))
}

/// Run `start` then `health` as one unit, retrying on any failure with
/// exponential backoff. On exhaustion the last underlying cause is
/// folded into the final startup error.
pub async fn retry_start<T, S, SF, H, HF>(
    service: &str,
    policy: &RetryPolicy,
    mut start: S,
    mut health: H,
) -> Result<T, ServiceError>
where
    S: FnMut() -> SF,
    SF: Future<Output = Result<T, ServiceError>>,
    H: FnMut() -> HF,
    HF: Future<Output = Result<(), ServiceError>>,
{
    let total = policy.max_retries + 1;
    let mut last_error: Option<ServiceError> = None;

    for attempt in 0..total {
        if attempt > 0 {
            let delay = backoff_delay(policy, attempt - 1);
            log::warn!(
                "[{}] attempt {}/{} failed: {}; retrying in {:.1}s",
                service,
                attempt,
                total,
                last_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default(),
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
        }

        match start().await {
            Ok(value) => match health().await {
                Ok(()) => {
                    if attempt > 0 {
                        log::info!("[{}] succeeded on attempt {}", service, attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e) => last_error = Some(e),
            },
            Err(e) => last_error = Some(e),
        }
    }

    Err(ServiceError::Startup {
        service: service.to_string(),
        message: format!(
            "failed after {} attempts; last error: {}",
            total,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            ..RetryPolicy::default()
        }
    }

    fn fail(service: &str) -> ServiceError {
        ServiceError::Startup {
            service: service.to_string(),
            message: "spawn failed".to_string(),
        }
    }

    #[test]
    fn test_backoff_delay_sequence() {
        let policy = RetryPolicy::default();
        assert_eq!(backoff_delay(&policy, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let policy = RetryPolicy::default();
        // 2^10 seconds would be far past the cap
        assert_eq!(backoff_delay(&policy, 10), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_attempts_exactly_n_plus_one() {
        let mut attempts = 0u32;
        let result: Result<(), _> = retry_start(
            "doomed",
            &policy(3),
            || {
                attempts += 1;
                async { Err(fail("doomed")) }
            },
            || async { Ok(()) },
        )
        .await;

        assert_eq!(attempts, 4);
        match result {
            Err(ServiceError::Startup { service, message }) => {
                assert_eq!(service, "doomed");
                assert!(message.contains("4 attempts"));
                assert!(message.contains("spawn failed"));
            }
            other => panic!("expected startup error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_sum_to_expected_total() {
        let start = tokio::time::Instant::now();
        let _: Result<(), _> = retry_start(
            "doomed",
            &policy(3),
            || async { Err(fail("doomed")) },
            || async { Ok(()) },
        )
        .await;

        // Delays: 1 + 2 + 4 seconds between the four attempts.
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_failure_consumes_attempts_like_spawn_failure() {
        let mut starts = 0u32;
        let mut checks = 0u32;
        let result = retry_start(
            "unhealthy",
            &policy(2),
            || {
                starts += 1;
                async { Ok(42) }
            },
            || {
                checks += 1;
                async {
                    Err(ServiceError::HealthCheck {
                        service: "unhealthy".to_string(),
                        message: "probe never passed".to_string(),
                    })
                }
            },
        )
        .await;

        assert_eq!(starts, 3);
        assert_eq!(checks, 3);
        assert!(matches!(result, Err(ServiceError::Startup { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let mut attempts = 0u32;
        let result = retry_start(
            "flaky",
            &policy(3),
            || {
                attempts += 1;
                let ok = attempts >= 3;
                async move {
                    if ok {
                        Ok("started")
                    } else {
                        Err(fail("flaky"))
                    }
                }
            },
            || async { Ok(()) },
        )
        .await;

        assert_eq!(result.unwrap(), "started");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_first_attempt_success_sleeps_nothing() {
        let started = std::time::Instant::now();
        let result = retry_start(
            "instant",
            &policy(5),
            || async { Ok(1) },
            || async { Ok(()) },
        )
        .await;
        assert_eq!(result.unwrap(), 1);
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
