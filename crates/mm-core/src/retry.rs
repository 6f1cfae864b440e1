//! Caller-side retry for busy channels.
//!
//! The transactor never retries on its own. A `ChannelBusy` failure is the one
//! case that is always safe to repeat: nothing was written, so the device
//! state is unchanged.

use crate::error::TransactError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// How many times to try an operation and how long to wait between tries.
///
/// # Example
///
/// ```rust
/// use mm_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.max_attempts, 3);
/// assert_eq!(policy.backoff_delay, Duration::from_millis(100));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Constant delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_delay,
        }
    }
}

/// Run `op` until it returns anything other than `ChannelBusy`, or the
/// attempts run out. The last error is returned.
pub async fn retry_busy<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, TransactError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransactError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_busy() && attempt < attempts => {
                debug!(attempt, max_attempts = attempts, "channel busy, retrying");
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn busy() -> TransactError {
        TransactError::ChannelBusy {
            channel: "COM1".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_busy_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_busy(&RetryPolicy::default(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(busy())
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_busy(&RetryPolicy::new(2, Duration::from_millis(5)), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(busy())
        })
        .await;

        assert!(matches!(result, Err(TransactError::ChannelBusy { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_busy(&RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TransactError::ChannelClosed)
        })
        .await;

        assert!(matches!(result, Err(TransactError::ChannelClosed)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
