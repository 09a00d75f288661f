//! 统一的重试/退避策略

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// 退避策略：首次尝试失败后最多再重试 `max_retries` 次，
/// 第 n 次重试前等待 `base_delay * multiplier^(n-1)`。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl BackoffPolicy {
    pub const fn new(max_retries: u32, base_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_retries,
            base_delay,
            multiplier,
        }
    }

    /// 不重试
    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO, 1)
    }

    /// FTP 建立连接：2s 起指数退避
    pub const fn ftp_connect() -> Self {
        Self::new(3, Duration::from_secs(2), 2)
    }

    /// FTP 传输中的瞬时错误：固定 1s
    pub const fn ftp_transfer() -> Self {
        Self::new(3, Duration::from_secs(1), 1)
    }

    /// WebDAV 401：1s 起指数退避
    pub const fn webdav_auth() -> Self {
        Self::new(3, Duration::from_secs(1), 2)
    }

    /// 第 `retry` 次重试（从 1 开始）前的等待时间
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(self.multiplier.saturating_pow(exp))
    }
}

/// 按策略执行 `op`，只有 `retryable` 判定为真的错误才会重试
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: BackoffPolicy,
    label: &str,
    retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut retry = 0;
    loop {
        match op(retry).await {
            Ok(value) => return Ok(value),
            Err(e) if retry < policy.max_retries && retryable(&e) => {
                retry += 1;
                let delay = policy.delay(retry);
                warn!(
                    "{}失败，{:?} 后重试 ({}/{}): {}",
                    label, delay, retry, policy.max_retries, e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn exponential_delays() {
        let policy = BackoffPolicy::ftp_connect();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
    }

    #[test]
    fn fixed_delays() {
        let policy = BackoffPolicy::ftp_transfer();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_backoffs() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let counter = calls.clone();
        let result: Result<&str, String> = retry_with_backoff(
            BackoffPolicy::webdav_auth(),
            "测试",
            |_| true,
            |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("401".to_string())
                    } else {
                        Ok("ok")
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), String> = retry_with_backoff(
            BackoffPolicy::ftp_transfer(),
            "测试",
            |_| true,
            |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), String> = retry_with_backoff(
            BackoffPolicy::ftp_connect(),
            "测试",
            |e: &String| e.contains("temporary"),
            |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("permanent".to_string())
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
