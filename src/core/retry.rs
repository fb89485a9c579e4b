//! Provider 调用重试策略
//!
//! 有界指数退避：第 n 次失败后等待 `base_delay * 2^(n-1)`，最多 max_attempts 次调用；
//! 只重试可恢复错误（限流、5xx、连接重置 / 超时），其余错误立即返回。
//! 只包裹 Provider 调用，从不包裹工具执行，保证有副作用的工具不会因重试而重复执行。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// 服务端要求的等待时间最多照办这么久
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// 错误是否值得重试
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;

    /// 服务端给出的最短等待时间（如 429 的 Retry-After）
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// HTTP 状态码是否可重试：429 与 5xx
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// 错误信息是否指向网络 / 超时类问题（无状态码时的兜底判断）
pub fn is_transient_message(message: &str) -> bool {
    let m = message.to_lowercase();
    [
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "connection closed",
        "econnreset",
        "etimedout",
        "broken pipe",
        "network",
        "socket hang up",
        "temporarily unavailable",
        "service unavailable",
        "rate limit",
    ]
    .iter()
    .any(|k| m.contains(k))
}

/// 重试策略：最大尝试次数 + 基础延迟
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 1000)
    }
}

impl RetryPolicy {
    /// max_attempts 至少为 1
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 第 attempt 次（从 1 开始）失败后的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// 执行 op，可恢复错误按退避重试；最后一次仍失败则返回该错误
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: IsRetryable + Display,
    {
        self.run_inner(None, op).await
    }

    /// 同 run，但退避等待期间若 token 被取消则立即返回最近一次错误，不再发起新的尝试
    pub async fn run_cancellable<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: IsRetryable + Display,
    {
        self.run_inner(Some(cancel), op).await
    }

    async fn run_inner<T, E, F, Fut>(
        &self,
        cancel: Option<&CancellationToken>,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: IsRetryable + Display,
    {
        let mut attempt = 1u32;
        loop {
            let err = match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !err.is_retryable() {
                tracing::warn!(attempt, error = %err, "provider call failed (fatal, not retrying)");
                return Err(err);
            }
            if attempt >= self.max_attempts {
                tracing::warn!(
                    attempt,
                    error = %err,
                    "provider call failed, retries exhausted"
                );
                return Err(err);
            }
            let backoff = self.delay_for(attempt);
            let delay = match err.retry_after() {
                Some(hint) => backoff.max(hint.min(MAX_RETRY_AFTER)),
                None => backoff,
            };
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "provider call failed, retrying after backoff"
            );
            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            tracing::info!(attempt, "retry aborted by cancellation");
                            return Err(err);
                        }
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            attempt += 1;
        }
    }
}

/// 便捷函数：`with_retry(op, max_attempts, base_delay_ms)`
pub async fn with_retry<T, E, F, Fut>(op: F, max_attempts: u32, base_delay_ms: u64) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + Display,
{
    RetryPolicy::new(max_attempts, base_delay_ms).run(op).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;
    use crate::llm::LlmError;

    #[test]
    fn test_delay_schedule() {
        let p = RetryPolicy::new(5, 1000);
        assert_eq!(p.delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.delay_for(2), Duration::from_millis(2000));
        assert_eq!(p.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_retryable_status() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
    }

    #[tokio::test(start_paused = true)]
    async fn test_503_twice_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let c = calls.clone();
        let result: Result<&str, LlmError> = with_retry(
            move |_attempt| {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(LlmError::Http {
                            status: 503,
                            message: "unavailable".into(),
                        })
                    } else {
                        Ok("ok")
                    }
                }
            },
            3,
            1000,
        )
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_bounded_and_min_elapsed() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let c = calls.clone();
        let result: Result<(), LlmError> = RetryPolicy::new(4, 100)
            .run(move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(LlmError::Timeout)
                }
            })
            .await;
        assert!(matches!(result, Err(LlmError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 100 + 200 + 400
        assert!(start.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), LlmError> = with_retry(
            move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(LlmError::Auth("bad key".into()))
                }
            },
            3,
            1000,
        )
        .await;
        assert!(matches!(result, Err(LlmError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let c = calls.clone();
        let t = token.clone();
        let result: Result<(), LlmError> = RetryPolicy::new(5, 1000)
            .run_cancellable(&token, move |_| {
                let c = c.clone();
                let t = t.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    t.cancel();
                    Err(LlmError::RateLimited { retry_after_ms: None })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_extends_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let c = calls.clone();
        let result: Result<&str, LlmError> = RetryPolicy::new(3, 100)
            .run(move |_| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(LlmError::RateLimited {
                            retry_after_ms: Some(5000),
                        })
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_capped() {
        let start = Instant::now();
        let mut first = true;
        let result: Result<(), LlmError> = RetryPolicy::new(2, 100)
            .run(move |_| {
                let fail = std::mem::replace(&mut first, false);
                async move {
                    if fail {
                        Err(LlmError::RateLimited {
                            retry_after_ms: Some(3_600_000),
                        })
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        let elapsed = start.elapsed();
        assert!(elapsed >= MAX_RETRY_AFTER);
        assert!(elapsed < Duration::from_secs(120));
    }
}
