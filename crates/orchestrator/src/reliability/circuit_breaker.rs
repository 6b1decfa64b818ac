//! Circuit Breaker Implementation
//!
//! Per-agent state machine gating task attempts. The breaker itself is not
//! synchronized: it lives next to the agent's `HealthRecord` behind the
//! agent's lock, so both are updated as one critical section.
//!
//! Every transition has a `*_at(now)` form taking an explicit instant; the
//! plain forms read `tokio::time::Instant::now()` so paused-time tests can
//! drive backoff deterministically.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Attempt refused because the breaker is open or its probe is taken
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Circuit breaker is {state} - attempt rejected (retry after {retry_after:?})")]
pub struct CircuitOpenError {
    pub state: CircuitBreakerState,
    /// Time until the breaker admits a probe; zero while a probe is running
    pub retry_after: Duration,
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    /// Attempts flow through normally
    #[default]
    Closed,

    /// Attempts are rejected without running
    Open,

    /// Exactly one probe attempt is allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerState::Closed => write!(f, "closed"),
            CircuitBreakerState::Open => write!(f, "open"),
            CircuitBreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures while closed that open the circuit
    pub failure_threshold: u32,

    /// First open duration
    pub base_open_duration: Duration,

    /// Ceiling for the doubled open duration
    pub max_open_duration: Duration,

    /// Time spent closed after which the open duration falls back to base
    pub healthy_reset_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_open_duration: Duration::from_secs(5),
            max_open_duration: Duration::from_secs(300),
            healthy_reset_period: Duration::from_secs(60),
        }
    }
}

/// What an admitted attempt is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single half-open probe
    Probe,
}

/// Snapshot of breaker state and counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitBreakerState,
    /// Failures since the breaker last closed
    pub failures_since_close: u32,
    pub current_open_duration: Duration,
    pub times_opened: u64,
    pub rejected_attempts: u64,
    pub probes: u64,
    pub successful_recoveries: u64,
    pub forced_resets: u64,
}

/// Circuit breaker implementation
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitBreakerState,
    failures_since_close: u32,
    current_open_duration: Duration,
    opened_at: Option<Instant>,
    closed_at: Instant,
    probe_in_flight: bool,
    times_opened: u64,
    rejected_attempts: u64,
    probes: u64,
    successful_recoveries: u64,
    forced_resets: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let current_open_duration = config.base_open_duration;
        Self {
            config,
            state: CircuitBreakerState::Closed,
            failures_since_close: 0,
            current_open_duration,
            opened_at: None,
            closed_at: Instant::now(),
            probe_in_flight: false,
            times_opened: 0,
            rejected_attempts: 0,
            probes: 0,
            successful_recoveries: 0,
            forced_resets: 0,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.state
    }

    pub fn current_open_duration(&self) -> Duration {
        self.current_open_duration
    }

    pub fn try_acquire(&mut self) -> Result<Admission, CircuitOpenError> {
        self.try_acquire_at(Instant::now())
    }

    /// Gate one attempt. An open breaker whose interval has elapsed moves to
    /// half-open and hands out the probe.
    pub fn try_acquire_at(&mut self, now: Instant) -> Result<Admission, CircuitOpenError> {
        match self.state {
            CircuitBreakerState::Closed => Ok(Admission::Normal),
            CircuitBreakerState::Open => {
                let reopen_at = self
                    .opened_at
                    .map(|at| at + self.current_open_duration)
                    .unwrap_or(now);
                if now >= reopen_at {
                    self.transition_to_half_open();
                    self.take_probe()
                } else {
                    self.rejected_attempts += 1;
                    Err(CircuitOpenError {
                        state: CircuitBreakerState::Open,
                        retry_after: reopen_at - now,
                    })
                }
            }
            CircuitBreakerState::HalfOpen => self.take_probe(),
        }
    }

    pub fn on_success(&mut self) {
        self.on_success_at(Instant::now())
    }

    pub fn on_success_at(&mut self, now: Instant) {
        match self.state {
            CircuitBreakerState::Closed => {
                self.failures_since_close = 0;
                self.maybe_reset_backoff(now);
            }
            CircuitBreakerState::HalfOpen => {
                self.successful_recoveries += 1;
                self.transition_to_closed(now);
            }
            CircuitBreakerState::Open => {
                // An attempt admitted before a forced transition can still report
                debug!("Recorded success while circuit is open");
            }
        }
    }

    pub fn on_failure(&mut self) {
        self.on_failure_at(Instant::now())
    }

    pub fn on_failure_at(&mut self, now: Instant) {
        match self.state {
            CircuitBreakerState::Closed => {
                self.failures_since_close = self.failures_since_close.saturating_add(1);
                if self.failures_since_close >= self.config.failure_threshold {
                    self.transition_to_open(now);
                }
            }
            CircuitBreakerState::HalfOpen => {
                self.failures_since_close = self.failures_since_close.saturating_add(1);
                self.current_open_duration = self
                    .current_open_duration
                    .saturating_mul(2)
                    .min(self.config.max_open_duration);
                self.transition_to_open(now);
            }
            CircuitBreakerState::Open => {
                self.failures_since_close = self.failures_since_close.saturating_add(1);
            }
        }
    }

    /// Force the closed state (plan applied). The open duration is kept so a
    /// relapse does not restart from the base interval.
    pub fn force_close(&mut self) {
        self.force_close_at(Instant::now())
    }

    pub fn force_close_at(&mut self, now: Instant) {
        info!(from = %self.state, "Forcing circuit breaker to closed state");
        self.forced_resets += 1;
        self.transition_to_closed(now);
    }

    /// Move to half-open immediately so the next attempt is an early probe,
    /// optionally replacing the open duration (clamped to the configured range)
    pub fn force_half_open(&mut self, backoff: Option<Duration>) {
        if let Some(backoff) = backoff {
            self.current_open_duration = backoff
                .max(self.config.base_open_duration)
                .min(self.config.max_open_duration);
        }
        info!(
            from = %self.state,
            open_duration_ms = self.current_open_duration.as_millis() as u64,
            "Forcing circuit breaker to half-open state"
        );
        self.forced_resets += 1;
        self.transition_to_half_open();
    }

    /// Back to a fresh closed breaker with base backoff (manual release)
    pub fn reset(&mut self) {
        debug!("Resetting circuit breaker");
        self.current_open_duration = self.config.base_open_duration;
        self.transition_to_closed(Instant::now());
    }

    /// Remaining time before an open breaker admits a probe
    pub fn retry_after_at(&self, now: Instant) -> Option<Duration> {
        match (self.state, self.opened_at) {
            (CircuitBreakerState::Open, Some(at)) => {
                Some((at + self.current_open_duration).saturating_duration_since(now))
            }
            _ => None,
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state,
            failures_since_close: self.failures_since_close,
            current_open_duration: self.current_open_duration,
            times_opened: self.times_opened,
            rejected_attempts: self.rejected_attempts,
            probes: self.probes,
            successful_recoveries: self.successful_recoveries,
            forced_resets: self.forced_resets,
        }
    }

    fn take_probe(&mut self) -> Result<Admission, CircuitOpenError> {
        if self.probe_in_flight {
            self.rejected_attempts += 1;
            return Err(CircuitOpenError {
                state: CircuitBreakerState::HalfOpen,
                retry_after: Duration::ZERO,
            });
        }
        self.probe_in_flight = true;
        self.probes += 1;
        Ok(Admission::Probe)
    }

    fn maybe_reset_backoff(&mut self, now: Instant) {
        if self.current_open_duration != self.config.base_open_duration
            && now.saturating_duration_since(self.closed_at) >= self.config.healthy_reset_period
        {
            debug!(
                open_duration_ms = self.config.base_open_duration.as_millis() as u64,
                "Sustained healthy period - open duration back to base"
            );
            self.current_open_duration = self.config.base_open_duration;
        }
    }

    fn transition_to_open(&mut self, now: Instant) {
        warn!(
            failures = self.failures_since_close,
            open_duration_ms = self.current_open_duration.as_millis() as u64,
            "Circuit breaker opening - blocking attempts"
        );
        self.state = CircuitBreakerState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        self.times_opened += 1;
    }

    fn transition_to_half_open(&mut self) {
        debug!("Circuit breaker transitioning to half-open - awaiting probe");
        self.state = CircuitBreakerState::HalfOpen;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    fn transition_to_closed(&mut self, now: Instant) {
        if self.state != CircuitBreakerState::Closed {
            info!("Circuit breaker closing - agent recovered");
            self.closed_at = now;
        }
        self.state = CircuitBreakerState::Closed;
        self.failures_since_close = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            base_open_duration: Duration::from_secs(1),
            max_open_duration: Duration::from_secs(4),
            healthy_reset_period: Duration::from_secs(10),
        })
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut cb = breaker();
        let now = Instant::now();

        cb.on_failure_at(now);
        cb.on_failure_at(now);
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        cb.on_failure_at(now);
        assert_eq!(cb.state(), CircuitBreakerState::Open);

        let err = cb.try_acquire_at(now).unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(1));
        assert_eq!(cb.stats().rejected_attempts, 1);
    }

    #[test]
    fn test_single_probe_in_half_open() {
        let mut cb = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            cb.on_failure_at(now);
        }

        let later = now + Duration::from_secs(1);
        assert_eq!(cb.try_acquire_at(later), Ok(Admission::Probe));
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
        assert!(cb.try_acquire_at(later).is_err());

        cb.on_success_at(later);
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.try_acquire_at(later), Ok(Admission::Normal));
    }

    #[test]
    fn test_failed_probe_doubles_up_to_ceiling() {
        let mut cb = breaker();
        let mut now = Instant::now();
        for _ in 0..3 {
            cb.on_failure_at(now);
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            now += cb.current_open_duration();
            assert_eq!(cb.try_acquire_at(now), Ok(Admission::Probe));
            cb.on_failure_at(now);
            seen.push(cb.current_open_duration().as_secs());
        }
        assert_eq!(seen, vec![2, 4, 4, 4]);
    }

    #[test]
    fn test_backoff_resets_after_healthy_period() {
        let mut cb = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            cb.on_failure_at(now);
        }
        let probe_at = now + Duration::from_secs(1);
        cb.try_acquire_at(probe_at).unwrap();
        cb.on_failure_at(probe_at);
        assert_eq!(cb.current_open_duration(), Duration::from_secs(2));

        let closed_at = probe_at + Duration::from_secs(2);
        cb.try_acquire_at(closed_at).unwrap();
        cb.on_success_at(closed_at);

        cb.on_success_at(closed_at + Duration::from_secs(5));
        assert_eq!(cb.current_open_duration(), Duration::from_secs(2));
        cb.on_success_at(closed_at + Duration::from_secs(10));
        assert_eq!(cb.current_open_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_force_half_open_clamps_backoff() {
        let mut cb = breaker();
        cb.force_half_open(Some(Duration::from_secs(60)));
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
        assert_eq!(cb.current_open_duration(), Duration::from_secs(4));

        cb.force_close();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.stats().forced_resets, 2);
        assert_eq!(cb.stats().failures_since_close, 0);
    }
}
