//! Shared retry discipline for the OpenRouter-like and HuggingFace-like
//! clients (spec.md §4.B "Retry discipline").

use crate::errors::ProviderError;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// `initial_delay · 2^(attempt-1)` with uniform jitter in `[0, backoff)`.
    /// `attempt` is 1-based.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let backoff = self.initial_delay.saturating_mul(multiplier);
        let backoff_ms = backoff.as_millis() as f64;
        let jitter_ms = rand::random::<f64>() * backoff_ms;
        Duration::from_millis(jitter_ms as u64)
    }
}

/// Run `attempt` up to `policy.max_retries` times. Retries only on
/// `ProviderError::is_retryable()`; on exhaustion, returns the last
/// observed error unchanged (spec.md §4.B: "do not mask with a generic
/// message").
pub async fn retry_with_backoff<F, Fut, T>(
    policy: RetryPolicy,
    mut attempt: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut last_err: Option<ProviderError> = None;
    for n in 1..=policy.max_retries {
        match attempt(n).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && n < policy.max_retries => {
                tracing::warn!("provider call attempt {} failed, retrying: {}", n, e);
                tokio::time::sleep(policy.backoff_for_attempt(n)).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| ProviderError::TransientFailure("retries exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_after_retries_within_budget() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = retry_with_backoff(policy, move |_n| {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ProviderError::RateLimited("429".into()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_last_error_unchanged() {
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
        };
        let result: Result<(), ProviderError> =
            retry_with_backoff(policy, |_n| async { Err(ProviderError::RateLimited("429".into())) })
                .await;
        assert!(matches!(result, Err(ProviderError::RateLimited(_))));
    }

    #[tokio::test]
    async fn non_retryable_returns_immediately() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), ProviderError> = retry_with_backoff(policy, move |_n| {
            calls2.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::AuthFailed("401".into())) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::AuthFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
