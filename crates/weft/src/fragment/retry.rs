//! Retry-with-backoff for transient upstream transport errors.
//!
//! Only connect-level failures are retried: a timeout or an HTTP error status
//! goes straight to the fragment's fallback-or-error path so the tag's
//! `timeout` attribute keeps its meaning.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::FragmentErrorKind;

/// Configuration for retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retry attempts on top of the initial one.
    pub max_retries: u32,
    /// Base delay; the actual delay is `base * 2^attempt` plus jitter.
    pub base_delay: Duration,
    /// Cap on the computed delay.
    pub max_delay: Duration,
    /// Adds up to half of `base_delay` of random jitter when set.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Checked shift so misconfigured attempt counts saturate instead of
        // overflowing the multiplier.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_ms == 0 {
            return capped;
        }
        let jitter = Duration::from_millis(rand::rng().random_range(0..jitter_ms));
        (capped + jitter).min(self.max_delay)
    }
}

/// Verdict of a single attempt.
pub enum RetryAction<T> {
    Success(T),
    /// Transient failure; try again if the budget allows.
    Retry(FragmentErrorKind),
    /// Permanent failure; stop immediately.
    Fail(FragmentErrorKind),
}

/// Run `operation` until it succeeds, fails permanently, or the retry budget
/// is exhausted. The closure receives the attempt number (0-indexed).
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, FragmentErrorKind>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    for attempt in 0..=policy.max_retries {
        if token.is_cancelled() {
            return Err(FragmentErrorKind::Cancelled);
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(kind) => return Err(kind),
            RetryAction::Retry(kind) => {
                if attempt >= policy.max_retries {
                    return Err(kind);
                }
                tokio::select! {
                    _ = token.cancelled() => return Err(FragmentErrorKind::Cancelled),
                    _ = tokio::time::sleep(policy.delay_for_attempt(attempt)) => {}
                }
            }
        }
    }

    Err(FragmentErrorKind::Cancelled)
}
