// HLS Retry Utility: bounded retry with a fixed delay for segment fetching.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::JobConfig;
use crate::error::JobError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Wait between attempts.
    pub delay: Duration,
    /// When true, adds random jitter of [0, delay/2) to each wait.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &JobConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: config.retry_delay,
            jitter: config.retry_jitter,
        }
    }

    fn next_delay(&self) -> Duration {
        if !self.jitter {
            return self.delay;
        }
        let jitter_range_ms = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return self.delay;
        }
        let jitter_ms = rand::rng().random_range(0..jitter_range_ms);
        self.delay + Duration::from_millis(jitter_ms)
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    Success(T),
    /// Failed attempt worth repeating (transport error or any HTTP status).
    Retry(JobError),
    /// Permanent failure (decryption, local I/O).
    Fail(JobError),
}

impl<T> From<Result<T, JobError>> for RetryAction<T> {
    fn from(result: Result<T, JobError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(e) if e.is_retryable() => Self::Retry(e),
            Err(e) => Self::Fail(e),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or the retry
/// budget is spent. The closure receives the 0-indexed attempt number.
///
/// On exhaustion the error of the last attempt is returned.
pub async fn retry_with_delay<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, JobError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.next_delay();
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient error"
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(JobError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
