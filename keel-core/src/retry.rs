//! Bounded retry with classification of retryable errors.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{KeelError, Result};

/// Outcome classification for one retried attempt.
#[derive(Debug)]
pub enum RetryError {
    /// Try again after the interval.
    Retryable(KeelError),
    /// Abort immediately.
    Permanent(KeelError),
}

/// Mark an error as worth retrying.
pub fn retryable(err: KeelError) -> RetryError {
    RetryError::Retryable(err)
}

/// Mark an error as terminal.
pub fn permanent(err: KeelError) -> RetryError {
    RetryError::Permanent(err)
}

/// Invoke `op` up to `attempts` times with `interval` between attempts.
///
/// Permanent errors abort immediately, cancellation aborts with
/// [`KeelError::Canceled`], and exhaustion returns the last retryable error.
pub async fn retry<T, F, Fut>(
    cancel: &CancellationToken,
    attempts: u32,
    interval: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, RetryError>>,
{
    let mut last = None;
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(KeelError::Canceled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(RetryError::Permanent(err)) => return Err(err),
            Err(RetryError::Retryable(err)) => {
                debug!(attempt, error = %err, "retryable failure");
                last = Some(err);
            }
        }
        if attempt < attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(KeelError::Canceled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
    Err(last.unwrap_or_else(|| KeelError::Internal("retry invoked with zero attempts".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn internal(msg: &str) -> KeelError {
        KeelError::Internal(msg.to_string())
    }

    #[tokio::test]
    async fn test_succeeds_after_retryable_failures() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result = retry(&cancel, 5, Duration::from_millis(1), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err(retryable(internal("not ready")))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_aborts_immediately() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&cancel, 5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(permanent(internal("broken"))) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&cancel, 3, Duration::from_millis(1), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(retryable(internal(&format!("attempt {attempt}")))) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.unwrap_err().to_string().contains("attempt 3"));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = retry(&cancel, 3, Duration::from_secs(60), || async {
            Err(retryable(internal("never")))
        })
        .await;
        assert!(matches!(result, Err(KeelError::Canceled)));
    }
}
