//! Connection supervisor: pairs a [`CircuitBreaker`] with an exponential
//! backoff schedule for reconnecting outbound sockets (the remote publish
//! relay, and the UI's own reconnect logic when it drives C1).
//!
//! Grounded on the ad-hoc `sleep_backoff()` loop in the teacher's
//! `relay/mod.rs`, generalised into a reusable, testable component.

use std::time::Duration;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);
const BACKOFF_FACTOR: u32 = 2;
const MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffOutcome {
    /// Sleep for this long before the next attempt.
    Retry(Duration),
    /// `max_attempts` consecutive failures reached; give up.
    Exhausted,
}

/// Tracks the attempt count for a single reconnect cycle. Reset on success.
#[derive(Debug, Default)]
pub struct Reconnector {
    attempt: u32,
}

impl Reconnector {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Compute the delay before the next connection attempt and advance the
    /// internal counter. Returns `Exhausted` once `MAX_ATTEMPTS` consecutive
    /// failures have been recorded.
    pub fn next_backoff(&mut self) -> BackoffOutcome {
        if self.attempt >= MAX_ATTEMPTS {
            return BackoffOutcome::Exhausted;
        }
        let delay = BASE_DELAY
            .saturating_mul(BACKOFF_FACTOR.saturating_pow(self.attempt))
            .min(MAX_DELAY);
        self.attempt += 1;
        BackoffOutcome::Retry(delay)
    }

    /// Reset the attempt counter after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// A circuit breaker pre-configured with the spec's defaults (3 consecutive
/// failures to open, 30s open timeout, 2 consecutive successes to close),
/// paired with its own [`Reconnector`].
pub struct ConnectionSupervisor {
    pub breaker: CircuitBreaker,
    reconnector: std::sync::Mutex<Reconnector>,
}

impl ConnectionSupervisor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            breaker: CircuitBreaker::new(name, CircuitBreakerConfig::default()),
            reconnector: std::sync::Mutex::new(Reconnector::new()),
        }
    }

    /// Whether an outbound attempt should be made right now, consulting the
    /// circuit breaker only (backoff delay is the caller's sleep between
    /// `is_allowed` checks and `next_backoff` results).
    pub async fn is_allowed(&self) -> bool {
        self.breaker.is_allowed().await
    }

    pub async fn record_success(&self) {
        self.breaker.record_success().await;
        self.reconnector.lock().unwrap().reset();
    }

    pub async fn record_failure(&self) -> BackoffOutcome {
        self.breaker.record_failure().await;
        self.reconnector.lock().unwrap().next_backoff()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut r = Reconnector::new();
        let expect = [1u64, 2, 4, 8, 16, 30, 30, 30, 30, 30];
        for secs in expect {
            match r.next_backoff() {
                BackoffOutcome::Retry(d) => assert_eq!(d, Duration::from_secs(secs)),
                BackoffOutcome::Exhausted => panic!("should not exhaust yet"),
            }
        }
        assert_eq!(r.next_backoff(), BackoffOutcome::Exhausted);
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut r = Reconnector::new();
        r.next_backoff();
        r.next_backoff();
        r.reset();
        assert_eq!(r.next_backoff(), BackoffOutcome::Retry(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn supervisor_uses_spec_default_threshold() {
        let sup = ConnectionSupervisor::new("relay");
        assert!(sup.is_allowed().await);
        for _ in 0..3 {
            sup.record_failure().await;
        }
        assert!(!sup.is_allowed().await);
    }
}
