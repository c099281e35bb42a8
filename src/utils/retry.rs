use std::future::Future;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use crate::core::{Result, UploadError, UploadOptions};

/// Upper bound for a single exponential backoff wait.
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(60);

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// 固定延迟
    Fixed,
    /// 线性退避: base * (attempt + 1)
    #[default]
    Linear,
    /// 指数退避: base * 2^attempt, capped at `MAX_BACKOFF_DELAY`
    Exponential,
}

impl Backoff {
    /// Wait after the failed attempt number `attempt` (0 based).
    pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed => base,
            Backoff::Linear => base.saturating_mul(attempt.saturating_add(1)),
            Backoff::Exponential => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                std::cmp::min(base.saturating_mul(factor), MAX_BACKOFF_DELAY)
            }
        }
    }
}

/// 重试配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl From<&UploadOptions> for RetryPolicy {
    fn from(options: &UploadOptions) -> Self {
        Self {
            max_attempts: options.max_retries,
            base_delay: options.retry_delay,
            backoff: options.backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&UploadOptions::default())
    }
}

/// Runs `operation` until it succeeds, fails with a non retryable error, or runs out of attempts.
///
/// Cancellation wins over both a running attempt and a backoff wait and yields
/// `UploadError::Cancelled` without starting another attempt.
pub async fn retry_with_cancel<F, Fut, T>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            result = operation() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(UploadError::Cancelled) => return Err(UploadError::Cancelled),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                warn!("Attempt {}/{} failed: {}", attempt + 1, policy.max_attempts, err);
                last_error = Some(err);

                // 如果不是最后一次尝试，等待后重试
                if attempt + 1 < policy.max_attempts {
                    let delay = policy.backoff.delay(policy.base_delay, attempt);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    // 所有重试都失败了
    Err(last_error.unwrap_or_else(|| UploadError::internal("Retry limit exceeded")))
}
