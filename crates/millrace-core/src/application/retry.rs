use std::future::Future;
use std::time::Duration;

use crate::EngineError;

/// Backoff schedule for contended operations, typically lock acquisition
///
/// The default schedule waits 50ms, 250ms, 1.25s and 6.25s between the
/// initial attempt and four retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every retry
    pub backoff_factor: u32,
    /// Number of retries after the initial attempt
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            backoff_factor: 5,
            max_retries: 4,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits, for tests exercising contention paths
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            backoff_factor: 1,
            max_retries: 4,
        }
    }
}

/// Run `attempt` until it yields a value, backing off between tries
///
/// `Ok(None)` means "not yet, try again"; errors abort immediately. When the
/// schedule is exhausted the result is [`EngineError::LockFailed`] carrying
/// `description`.
pub async fn retry_until_some<T, F, Fut>(
    policy: &RetryPolicy,
    description: &str,
    mut attempt: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, EngineError>>,
{
    let mut delay = policy.initial_delay;
    let mut tries = 0;
    loop {
        if let Some(value) = attempt().await? {
            return Ok(value);
        }
        if tries >= policy.max_retries {
            return Err(EngineError::LockFailed(format!(
                "{} after {} attempts",
                description,
                tries + 1
            )));
        }
        tracing::debug!(
            attempt = tries + 1,
            delay_ms = delay.as_millis() as u64,
            "{} contended, backing off",
            description
        );
        tokio::time::sleep(delay).await;
        delay *= policy.backoff_factor;
        tries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_first_attempt_success_does_not_wait() {
        let policy = RetryPolicy::default();
        let result = retry_until_some(&policy, "lock", || async { Ok(Some(7)) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<u32, _> = retry_until_some(&policy, "lock", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await;

        assert_eq!(result, Err(EngineError::LockFailed("lock after 5 attempts".to_string())));
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        // 50 + 250 + 1250 + 6250
        assert_eq!(started.elapsed(), Duration::from_millis(7800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_later_attempt() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);

        let result = retry_until_some(&policy, "lock", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move { Ok(if n == 2 { Some("won") } else { None }) }
        })
        .await;

        assert_eq!(result, Ok("won"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_error_aborts_immediately() {
        let policy = RetryPolicy::default();
        let result: Result<u32, _> = retry_until_some(&policy, "lock", || async {
            Err(EngineError::StoreError("down".to_string()))
        })
        .await;
        assert_eq!(result, Err(EngineError::StoreError("down".to_string())));
    }
}
