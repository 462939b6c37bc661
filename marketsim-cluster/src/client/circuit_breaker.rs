//! Per-destination circuit breaker
//!
//! Closed counts failures until the threshold opens the circuit. An open
//! circuit rejects calls until the recovery timeout has passed since the last
//! failure; the next state read then moves it to half-open. In half-open the
//! next outcome decides: success closes (failure count reset), failure reopens.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_FAILURE_THRESHOLD: u64 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
}

impl Inner {
    /// Apply the lazy open -> half-open transition
    fn refresh(&mut self, timeout: Duration) -> CircuitState {
        if self.state == CircuitState::Open
            && self.last_failure.is_some_and(|at| at.elapsed() > timeout)
        {
            self.state = CircuitState::HalfOpen;
        }
        self.state
    }
}

/// Observability snapshot of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
    pub threshold: u64,
    pub timeout_secs: f64,
    pub since_last_failure_secs: Option<f64>,
    pub since_last_success_secs: Option<f64>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u64,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT)
    }
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(threshold: u64, timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_success: None,
            }),
        }
    }

    /// Current state, moving open to half-open once the timeout has passed
    pub fn state(&self) -> CircuitState {
        self.inner.lock().refresh(self.timeout)
    }

    /// Whether a call may go through
    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.refresh(self.timeout);
        inner.success_count += 1;
        inner.last_success = Some(Instant::now());

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            tracing::info!("Circuit breaker closed after successful probe");
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.refresh(self.timeout);
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.threshold => {
                inner.state = CircuitState::Open;
                tracing::warn!(failures = inner.failure_count, "Circuit breaker opened");
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                tracing::warn!("Circuit breaker reopened after failed probe");
            }
            _ => {}
        }
    }

    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.inner.lock();
        let state = inner.refresh(self.timeout);
        CircuitBreakerSnapshot {
            state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            threshold: self.threshold,
            timeout_secs: self.timeout.as_secs_f64(),
            since_last_failure_secs: inner.last_failure.map(|at| at.elapsed().as_secs_f64()),
            since_last_success_secs: inner.last_success.map(|at| at.elapsed().as_secs_f64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_success_in_closed_does_not_reset_failures() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes_and_resets() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(10));
        breaker.record_failure();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().failure_count, 2);

        breaker.record_success();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_restarts_timer() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_snapshot_strings() {
        let breaker = CircuitBreaker::default();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state.as_str(), "closed");
        assert_eq!(snapshot.threshold, DEFAULT_FAILURE_THRESHOLD);
        assert_eq!(snapshot.timeout_secs, 30.0);
        assert!(snapshot.since_last_failure_secs.is_none());
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }
}
