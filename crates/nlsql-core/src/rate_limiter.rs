//! Rate Limiter (C6): named counting semaphores with bounded acquire waits.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::error::RateLimitError;

/// A single named capacity class (e.g. `"query"`, `"llm"`).
pub struct RateLimiter {
    name: String,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
    waiting: AtomicUsize,
    total_acquired: AtomicUsize,
    rejected: AtomicUsize,
}

/// A held slot; releases its semaphore permit on drop, including on
/// cancellation (the future carrying this guard is simply dropped).
pub struct RateLimitGuard {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquire_timeout,
            waiting: AtomicUsize::new(0),
            total_acquired: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    /// Acquire one slot, waiting up to `acquire_timeout`. Cancelling the
    /// returned future before it resolves releases any partial wait state
    /// cleanly — `tokio::sync::Semaphore::acquire` drops its registration.
    pub async fn acquire(&self) -> Result<RateLimitGuard, RateLimitError> {
        self.waiting.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = timeout(self.acquire_timeout, self.semaphore.clone().acquire_owned()).await;
        self.waiting.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(Ok(permit)) => {
                self.total_acquired.fetch_add(1, Ordering::Relaxed);
                Ok(RateLimitGuard { _permit: permit })
            }
            Ok(Err(_)) | Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(RateLimitError {
                    name: self.name.clone(),
                    waited: started.elapsed(),
                })
            }
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            name: self.name.clone(),
            capacity: self.capacity,
            currently_held: self.capacity - self.semaphore.available_permits(),
            currently_waiting: self.waiting.load(Ordering::Relaxed),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub name: String,
    pub capacity: usize,
    pub currently_held: usize,
    pub currently_waiting: usize,
    pub total_acquired: usize,
    pub rejected: usize,
}

/// The named families the orchestrator draws from: `query` (C2) and `llm` (C4).
pub struct RateLimiterRegistry {
    limiters: HashMap<String, RateLimiter>,
}

impl RateLimiterRegistry {
    pub fn new(limiters: HashMap<String, RateLimiter>) -> Self {
        Self { limiters }
    }

    pub fn get(&self, name: &str) -> Option<&RateLimiter> {
        self.limiters.get(name)
    }

    pub fn all_stats(&self) -> Vec<RateLimiterStats> {
        self.limiters.values().map(RateLimiter::stats).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_frees_capacity() {
        let limiter = RateLimiter::new("query", 1, Duration::from_millis(100));
        let guard = limiter.acquire().await.unwrap();
        assert_eq!(limiter.stats().currently_held, 1);
        drop(guard);
        // Permit release is synchronous on drop.
        assert_eq!(limiter.stats().currently_held, 0);
    }

    #[tokio::test]
    async fn acquire_times_out_when_capacity_exhausted() {
        let limiter = RateLimiter::new("query", 1, Duration::from_millis(20));
        let _held = limiter.acquire().await.unwrap();
        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err.name, "query");
    }

    #[tokio::test]
    async fn currently_held_never_exceeds_cap() {
        let limiter = RateLimiter::new("llm", 2, Duration::from_millis(50));
        let _a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert!(limiter.acquire().await.is_err());
        assert!(limiter.stats().currently_held <= 2);
    }
}
