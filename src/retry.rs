//! Bounded retry with a fixed delay between attempts.

use std::future::Future;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay between a failed attempt and the next one.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(3))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, attempts: u32 },
    Exhausted { last_error: E, attempts: u32 },
}

/// Call `action(attempt)` (1-based) until it succeeds or the policy runs out.
///
/// There is no delay after the final failed attempt.
pub async fn retry_bounded<T, E, F, Fut>(policy: RetryPolicy, mut action: F) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match action(attempt).await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                };
            }
            Err(last_error) if attempt >= max_attempts => {
                return RetryOutcome::Exhausted {
                    last_error,
                    attempts: attempt,
                };
            }
            Err(_) => {
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts_with_fixed_backoff() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let outcome: RetryOutcome<(), String> = retry_bounded(RetryPolicy::default(), |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {n}")) }
        })
        .await;

        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                last_error: "attempt 10".to_string(),
                attempts: 10
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        // Nine gaps, none after the last attempt.
        assert_eq!(start.elapsed(), Duration::from_secs(27));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_first_success() {
        let outcome: RetryOutcome<u32, ()> =
            retry_bounded(RetryPolicy::default(), |n| async move {
                if n == 3 { Ok(n * 10) } else { Err(()) }
            })
            .await;

        assert_eq!(
            outcome,
            RetryOutcome::Succeeded {
                value: 30,
                attempts: 3
            }
        );
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let outcome: RetryOutcome<(), ()> =
            retry_bounded(RetryPolicy::new(0, Duration::ZERO), |_| async { Err(()) }).await;
        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                last_error: (),
                attempts: 1
            }
        );
    }
}
