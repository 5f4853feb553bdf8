//! Retry Engine (C8): exponential backoff with half-jitter over a
//! caller-supplied retryability predicate.

use std::time::Duration;

use rand::Rng;

/// Backoff schedule: attempt `i` (0-indexed) sleeps
/// `min(base * factor^i, max_delay) * U(0.5, 1.0)` before the next try.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw_ms = (self.base_delay.as_millis() as f64) * self.factor.powi(attempt as i32);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);
        let jittered_ms = if self.jitter {
            let mut rng = rand::thread_rng();
            capped_ms * rng.gen_range(0.5..=1.0)
        } else {
            capped_ms
        };
        Duration::from_millis(jittered_ms.round() as u64)
    }
}

/// Outcome of a single attempt, as judged by the caller's retryability rule.
pub enum Outcome<T, E> {
    Success(T),
    Retryable(E),
    Fatal(E),
}

/// Runs `attempt` up to `policy.max_attempts` times, sleeping a half-jittered
/// backoff between retryable failures. Returns the last error if attempts are
/// exhausted or a fatal error is reported.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Outcome<T, E>>,
{
    let mut last_err = None;
    for i in 0..policy.max_attempts {
        match attempt(i).await {
            Outcome::Success(v) => return Ok(v),
            Outcome::Fatal(e) => return Err(e),
            Outcome::Retryable(e) => {
                last_err = Some(e);
                if i + 1 < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for_attempt(i)).await;
                }
            }
        }
    }
    Err(last_err.expect("max_attempts >= 1 guarantees at least one iteration"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(10),
            jitter: true,
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let result: Result<i32, &str> =
            retry(&policy(), |_| async { Outcome::Success(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_up_to_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<i32, &str> = retry(&policy(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Outcome::Retryable("transient") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<i32, &str> = retry(&policy(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Outcome::Fatal("permanent") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_never_exceeds_max() {
        let p = policy();
        for attempt in 0..10 {
            assert!(p.delay_for_attempt(attempt) <= p.max_delay);
        }
    }
}
