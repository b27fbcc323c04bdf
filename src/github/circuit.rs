//! Circuit breaker over the shared transport.
//!
//! Sustained transport failures, timeouts and 5xx responses open the
//! circuit; while open, callers are refused immediately instead of piling
//! onto a struggling server. After a cooldown a single probe is let
//! through (half-open); its outcome decides whether the circuit closes
//! again.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        CircuitBreaker::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT)
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        CircuitBreaker {
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Any success closes the circuit and zeroes the counter.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.state = CircuitState::Closed;
    }

    /// Failures accumulate; at the threshold the circuit opens.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        if inner.failure_count >= self.failure_threshold {
            inner.state = CircuitState::Open;
        }
    }

    /// Whether a request may be dispatched right now.
    ///
    /// In the open state this flips to half-open (and admits the caller as
    /// the probe) once the recovery timeout has elapsed since the last
    /// failure. While half-open, everyone except that first probe is
    /// refused.
    pub fn can_attempt(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if inner
                    .last_failure
                    .is_some_and(|at| at.elapsed() >= self.recovery_timeout)
                {
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => false,
        }
    }

    /// Remaining cooldown; zero unless the circuit is open.
    pub fn wait_duration(&self) -> Duration {
        let inner = self.lock();
        if inner.state != CircuitState::Open {
            return Duration::ZERO;
        }
        match inner.last_failure {
            Some(at) => self.recovery_timeout.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
