//! Database retry logic
//!
//! Catalog inserts and snapshot commits can meet SQLite lock contention when
//! several pulsar workers finish at once. Lock errors are retried with
//! exponential backoff; every other error is returned immediately.

use std::time::{Duration, Instant};
use tmg_common::{Error, Result};

/// Backoff schedule for lock retries
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// First sleep after a lock error
    pub initial_backoff: Duration,
    /// Sleep never exceeds this
    pub max_backoff: Duration,
    /// Give up once this much time has passed since the first attempt
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(1000),
            max_wait: Duration::from_millis(15_000),
        }
    }
}

/// Retry a database operation while it fails with "database is locked".
///
/// Backoff starts at `initial_backoff`, doubles per attempt and is capped at
/// `max_backoff`. When `max_wait` has elapsed the last lock error is turned
/// into `Error::Internal` naming the operation.
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let mut attempt = 0u32;
    let mut backoff = policy.initial_backoff;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Database operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if err.is_database_locked() => {
                let elapsed = start_time.elapsed();
                if elapsed >= policy.max_wait {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Database still locked, giving up"
                    );
                    return Err(Error::Internal(format!(
                        "{}: database locked after {} attempts ({} ms)",
                        operation_name,
                        attempt,
                        elapsed.as_millis()
                    )));
                }

                let sleep_for = backoff.min(policy.max_backoff);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = sleep_for.as_millis() as u64,
                    "Database locked, retrying"
                );
                tokio::time::sleep(sleep_for).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locked() -> Error {
        Error::Database(sqlx::Error::Protocol("database is locked".to_string()))
    }

    fn fast_policy(max_wait_ms: u64) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            max_wait: Duration::from_millis(max_wait_ms),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let result = retry_on_lock("test_op", fast_policy(100), || async { Ok::<i32, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_lock_errors() {
        let mut attempts = 0;
        let result = retry_on_lock("test_op", fast_policy(5000), || {
            attempts += 1;
            let current = attempts;
            async move {
                if current < 3 {
                    Err(locked())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_wait() {
        let result = retry_on_lock("catalog insert", fast_policy(20), || async {
            Err::<i32, Error>(locked())
        })
        .await;

        match result {
            Err(Error::Internal(msg)) => assert!(msg.contains("catalog insert")),
            other => panic!("expected Internal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_lock_error_fails_immediately() {
        let mut attempts = 0;
        let result = retry_on_lock("test_op", fast_policy(5000), || {
            attempts += 1;
            async move { Err::<i32, Error>(Error::Internal("other error".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
