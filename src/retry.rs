use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Retry an async operation with exponential backoff while `retryable` accepts
/// the error. Gives up after `attempts` tries and returns the last error.
pub async fn retry_async<F, Fut, T, E, P>(
    mut op: F,
    retryable: P,
    attempts: usize,
    initial_delay: Duration,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut delay = initial_delay;
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts && retryable(&e) => {
                tracing::debug!(attempt, error = %e, ?delay, "retrying after transient error");
                sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let counter = AtomicUsize::new(0);
        let res: Result<u32, NodeError> = retry_async(
            |_| {
                let current = counter.fetch_add(1, Ordering::Relaxed);
                async move {
                    if current < 2 {
                        Err(NodeError::Connectivity("down".into()))
                    } else {
                        Ok(7)
                    }
                }
            },
            NodeError::is_retryable,
            4,
            Duration::from_millis(1),
        )
        .await;

        assert_eq!(res.unwrap(), 7);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let counter = AtomicUsize::new(0);
        let res: Result<u32, NodeError> = retry_async(
            |_| {
                counter.fetch_add(1, Ordering::Relaxed);
                async { Err(NodeError::Rpc("bad request".into())) }
            },
            NodeError::is_retryable,
            4,
            Duration::from_millis(1),
        )
        .await;

        assert!(res.is_err());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let counter = AtomicUsize::new(0);
        let res: Result<u32, NodeError> = retry_async(
            |_| {
                counter.fetch_add(1, Ordering::Relaxed);
                async { Err(NodeError::Connectivity("down".into())) }
            },
            NodeError::is_retryable,
            3,
            Duration::from_millis(1),
        )
        .await;

        assert!(matches!(res, Err(NodeError::Connectivity(_))));
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }
}
