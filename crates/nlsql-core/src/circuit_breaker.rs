//! Circuit Breaker (C7): per-key CLOSED/OPEN/HALF_OPEN state machine guarding
//! calls to a failing downstream (an LLM endpoint or a database).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::CircuitOpenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

/// One breaker per key (e.g. a database id, or `"llm"`).
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
    /// CAS flag enforcing the single-probe invariant in HALF_OPEN.
    probe_in_flight: AtomicBool,
}

/// A permit to attempt the call. Drop without calling `record_success` /
/// `record_failure` leaves the breaker's failure count unchanged; callers
/// must report the outcome explicitly.
pub struct ProbePermit {
    is_probe: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
            }),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    /// Request permission to call the guarded resource. Transitions OPEN ->
    /// HALF_OPEN once `cooldown` has elapsed, admitting exactly one probe.
    pub fn try_acquire(&self, key: &str) -> Result<ProbePermit, CircuitOpenError> {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");

        match inner.state {
            CircuitState::Closed => Ok(ProbePermit { is_probe: false }),
            CircuitState::HalfOpen => {
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    Ok(ProbePermit { is_probe: true })
                } else {
                    Err(CircuitOpenError { key: key.to_string() })
                }
            }
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    if self
                        .probe_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Ok(ProbePermit { is_probe: true });
                    }
                }
                Err(CircuitOpenError { key: key.to_string() })
            }
        }
    }

    pub fn record_success(&self, permit: ProbePermit) {
        if permit.is_probe {
            self.probe_in_flight.store(false, Ordering::Release);
        }
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self, permit: ProbePermit) {
        if permit.is_probe {
            self.probe_in_flight.store(false, Ordering::Release);
        }
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::HalfOpen => {
                // A failed probe re-opens the circuit immediately.
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {
                inner.failure_count += 1;
                if inner.failure_count >= self.threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("circuit breaker mutex poisoned").state
    }
}

/// One breaker per key, created lazily on first use.
pub struct CircuitBreakerRegistry {
    threshold: u32,
    cooldown: Duration,
    breakers: Mutex<HashMap<String, std::sync::Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, key: &str) -> std::sync::Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("registry mutex poisoned");
        breakers
            .entry(key.to_string())
            .or_insert_with(|| std::sync::Arc::new(CircuitBreaker::new(self.threshold, self.cooldown)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            let permit = cb.try_acquire("main").unwrap();
            cb.record_failure(permit);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire("main").is_err());
    }

    #[test]
    fn half_open_admits_single_probe() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(1));
        let permit = cb.try_acquire("main").unwrap();
        cb.record_failure(permit);
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(5));

        let probe = cb.try_acquire("main").unwrap();
        assert!(cb.try_acquire("main").is_err());
        cb.record_success(probe);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        let permit = cb.try_acquire("main").unwrap();
        cb.record_failure(permit);
        let permit = cb.try_acquire("main").unwrap();
        cb.record_success(permit);
        let permit = cb.try_acquire("main").unwrap();
        cb.record_failure(permit);
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
