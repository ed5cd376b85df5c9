use std::future::Future;
use std::time::Duration;
use tracing::warn;

use shared_config::AppConfig;
use shared_models::AppError;

use crate::store::StoreResult;

/// Bounded wait and retry for store writes. Only transient failures are
/// retried, with a linear backoff of `base_delay * attempt`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.store_write_max_attempts.max(1),
            timeout: config.store_write_timeout(),
            ..Self::default()
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match tokio::time::timeout(self.timeout, attempt_fn()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) => error,
                Err(_) => AppError::Timeout(self.timeout.as_millis() as u64),
            };

            if !error.is_transient() || attempt >= max_attempts {
                return Err(error);
            }

            warn!(
                "{} failed with transient error, retrying attempt {}/{}: {}",
                operation,
                attempt + 1,
                max_attempts,
                error
            );
            tokio::time::sleep(self.base_delay * attempt).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = fast_policy()
            .run("create notification", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AppError::Network("connection reset".into()))
                    } else {
                        Ok("doc-1")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("doc-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permission_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: StoreResult<()> = fast_policy()
            .run("update notification", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::PermissionDenied("rules".into()))
                }
            })
            .await;

        assert_eq!(result, Err(AppError::PermissionDenied("rules".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_writes_time_out() {
        let policy = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(10),
        };

        let result: StoreResult<()> = policy
            .run("slow write", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;

        assert_eq!(result, Err(AppError::Timeout(10)));
    }
}
