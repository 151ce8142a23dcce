//! Bounded exponential backoff for outbound HTTP calls.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::PublishError;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn once() -> Self { Self { max_attempts: 1, ..Default::default() } }

    /// Wait before attempt `attempt + 1`, for `attempt >= 1`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `operation` until it succeeds, fails terminally, runs out of attempts
/// or `cancel` fires. Non-retryable errors return immediately.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, PublishError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PublishError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PublishError::Cancelled),
            r = operation() => r,
        };
        let e = match result {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if !e.is_retryable() {
            return Err(e);
        }
        if attempt >= policy.max_attempts.max(1) {
            error!(operation = %operation_name, attempt, error = %e, "operation failed after max retries");
            return Err(e);
        }
        let delay = policy.delay_after(attempt);
        warn!(operation = %operation_name, attempt, error = %e, delay_ms = delay.as_millis() as u64, "operation failed, retrying");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PublishError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn unavailable() -> PublishError {
        PublishError::Status { endpoint: "http://cp".into(), status: 503, body: "busy".into() }
    }

    #[test]
    fn delays_double_and_cap() {
        let p = RetryPolicy { max_attempts: 6, ..Default::default() };
        let delays: Vec<u64> = (1..=4).map(|a| p.delay_after(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_backoff() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let out = retry_with_backoff(&RetryPolicy::default(), "post", &CancellationToken::new(), || {
            let calls = &calls;
            async move { if calls.fetch_add(1, Ordering::SeqCst) < 2 { Err(unavailable()) } else { Ok("ok") } }
        })
        .await;
        assert_eq!(out.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(4), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = retry_with_backoff(&RetryPolicy::default(), "post", &CancellationToken::new(), || {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            }
        })
        .await;
        assert!(matches!(out, Err(PublishError::Status { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = retry_with_backoff(&RetryPolicy::default(), "post", &CancellationToken::new(), || {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PublishError::Status { endpoint: "http://cp".into(), status: 422, body: String::new() })
            }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        let out: Result<(), _> =
            retry_with_backoff(&RetryPolicy::default(), "post", &cancel, || async { Err(unavailable()) }).await;
        assert!(matches!(out, Err(PublishError::Cancelled)));
    }
}
