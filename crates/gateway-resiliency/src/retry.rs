// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Retry/Backoff Engine (C5): classifies errors, retries retryable ones with
//! jittered exponential backoff, and refuses to retry a mutated prompt.

use std::future::Future;
use std::time::Duration;

use gateway_model::{CompletionResponse, GatewayError};
use rand::Rng;

/// An attempt's failure, carrying an optional upstream `Retry-After` hint
/// (seconds) that takes precedence over the computed backoff when present.
#[derive(Debug, Clone)]
pub struct AttemptError {
    pub error: GatewayError,
    pub retry_after: Option<Duration>,
}

impl AttemptError {
    pub fn new(error: GatewayError) -> Self {
        Self { error, retry_after: None }
    }

    pub fn with_retry_after(error: GatewayError, retry_after: Duration) -> Self {
        Self { error, retry_after: Some(retry_after) }
    }
}

impl From<GatewayError> for AttemptError {
    fn from(error: GatewayError) -> Self {
        Self::new(error)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(500), max_attempts: 4 }
    }
}

impl RetryPolicy {
    /// `base · 2^(n-1)` for attempt `n` (1-indexed), plus jitter uniform in
    /// `[0, 0.5 · delay]`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt as i32 - 1));
        let jitter_fraction: f64 = rand::thread_rng().gen_range(0.0..0.5);
        exp + exp.mul_f64(jitter_fraction)
    }
}

#[derive(Debug)]
pub struct RetryOutcome {
    pub response: CompletionResponse,
    pub attempts: u32,
    pub last_backoff_ms: Option<u64>,
}

/// Drives `call` up to `policy.max_attempts` times. `call` receives the
/// 1-indexed attempt number and must return the hash of the messages it
/// actually sent alongside its result, so a mutated prompt on retry is
/// caught rather than silently sent (P1).
pub async fn retry_with_backoff<F, Fut>(
    policy: &RetryPolicy,
    expected_messages_hash: &str,
    mut call: F,
) -> Result<RetryOutcome, GatewayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(CompletionResponse, String), AttemptError>>,
{
    let mut last_backoff_ms = None;
    let mut last_error: Option<GatewayError> = None;

    for attempt in 1..=policy.max_attempts {
        match call(attempt).await {
            Ok((response, sent_hash)) => {
                if sent_hash != expected_messages_hash {
                    return Err(GatewayError::new(
                        gateway_model::ErrorKind::InvalidRequest,
                        "prompt hash changed between retry attempts",
                    ));
                }
                return Ok(RetryOutcome { response, attempts: attempt, last_backoff_ms });
            }
            Err(attempt_err) => {
                let retryable = attempt_err.error.retryable();
                last_error = Some(attempt_err.error.clone());
                if !retryable || attempt == policy.max_attempts {
                    break;
                }
                let backoff = attempt_err.retry_after.unwrap_or_else(|| policy.backoff_for_attempt(attempt));
                last_backoff_ms = Some(backoff.as_millis() as u64);
                tracing::warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    kind = %attempt_err.error.kind,
                    "retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        GatewayError::new(gateway_model::ErrorKind::ServiceUnavailableUpstream, "retry engine exhausted with no recorded error")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_model::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ok_response() -> CompletionResponse {
        CompletionResponse::error(ErrorKind::EmptyCompletion, "placeholder").tap_success()
    }

    trait TapSuccess {
        fn tap_success(self) -> Self;
    }
    impl TapSuccess for CompletionResponse {
        fn tap_success(mut self) -> Self {
            self.success = true;
            self.error_kind = None;
            self.error_message = None;
            self
        }
    }

    #[tokio::test]
    async fn succeeds_immediately_without_retry() {
        let policy = RetryPolicy { base_delay: Duration::from_millis(1), max_attempts: 4 };
        let hash = "abc";
        let outcome = retry_with_backoff(&policy, hash, |_attempt| async move { Ok((ok_response(), hash.to_string())) })
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn retries_retryable_errors_until_success() {
        let policy = RetryPolicy { base_delay: Duration::from_millis(1), max_attempts: 4 };
        let hash = "abc";
        let calls = AtomicU32::new(0);
        let outcome = retry_with_backoff(&policy, hash, |_attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AttemptError::new(GatewayError::new(ErrorKind::ServiceUnavailableUpstream, "down")))
                } else {
                    Ok((ok_response(), hash.to_string()))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable_errors() {
        let policy = RetryPolicy { base_delay: Duration::from_millis(1), max_attempts: 4 };
        let hash = "abc";
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&policy, hash, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(AttemptError::new(GatewayError::new(ErrorKind::InvalidRequest, "bad request"))) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy { base_delay: Duration::from_millis(1), max_attempts: 4 };
        let hash = "abc";
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&policy, hash, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(AttemptError::new(GatewayError::new(ErrorKind::Timeout, "timed out"))) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn mutated_prompt_on_retry_is_rejected() {
        let policy = RetryPolicy { base_delay: Duration::from_millis(1), max_attempts: 4 };
        let result = retry_with_backoff(&policy, "original_hash", |_attempt| async move {
            Ok((ok_response(), "mutated_hash".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn backoff_grows_exponentially_with_base() {
        let policy = RetryPolicy { base_delay: Duration::from_millis(500), max_attempts: 4 };
        let b1 = policy.backoff_for_attempt(1);
        let b2 = policy.backoff_for_attempt(2);
        assert!(b1 >= Duration::from_millis(500));
        assert!(b1 <= Duration::from_millis(750));
        assert!(b2 >= Duration::from_millis(1000));
        assert!(b2 <= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn retry_after_hint_is_honored_over_computed_backoff() {
        let policy = RetryPolicy { base_delay: Duration::from_secs(60), max_attempts: 2 };
        let hash = "abc";
        let calls = AtomicU32::new(0);
        let outcome = retry_with_backoff(&policy, hash, |_attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(AttemptError::with_retry_after(
                        GatewayError::new(ErrorKind::RateLimited, "slow down"),
                        Duration::from_millis(5),
                    ))
                } else {
                    Ok((ok_response(), hash.to_string()))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(outcome.last_backoff_ms, Some(5));
    }
}
