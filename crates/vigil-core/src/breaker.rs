//! Circuit breaker gating outbound calls.
//!
//! States and transitions:
//!
//! | From      | Trigger                                   | To        |
//! |-----------|-------------------------------------------|-----------|
//! | CLOSED    | >= threshold failures inside the window   | OPEN      |
//! | OPEN      | open timeout elapsed                      | HALF_OPEN |
//! | HALF_OPEN | consecutive probe successes hit threshold | CLOSED    |
//! | HALF_OPEN | any probe failure                         | OPEN      |
//!
//! While OPEN no call is attempted except bounded HALF_OPEN probes. A
//! status line is rate-limited to one per `open_log_interval_seconds`, and
//! exactly one alert fires per OPEN episode on the CLOSED→OPEN edge.
//!
//! The breaker checkpoints its state to disk so a process restart does not
//! forget an open circuit.

use std::collections::VecDeque;
use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{self, StoreError};

/// Breaker state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation; calls pass through.
    Closed,

    /// Failing fast; calls are denied.
    Open,

    /// Probing recovery; limited calls allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    /// Failures inside the window that trip the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Rolling window for counting failures, in seconds.
    #[serde(default = "default_failure_window_seconds")]
    pub failure_window_seconds: u64,

    /// Upper bound on how long the circuit stays open, in seconds.
    #[serde(default = "default_open_timeout_seconds")]
    pub open_timeout_seconds: u64,

    /// Seconds after opening before HALF_OPEN probes are allowed.
    #[serde(default = "default_half_open_after_seconds")]
    pub half_open_after_seconds: u64,

    /// Consecutive probe successes required to close the circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Minimum spacing of OPEN status log lines, in seconds.
    #[serde(default = "default_open_log_interval_seconds")]
    pub open_log_interval_seconds: u64,
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_failure_window_seconds() -> u64 {
    600
}

const fn default_open_timeout_seconds() -> u64 {
    1800
}

const fn default_half_open_after_seconds() -> u64 {
    600
}

const fn default_success_threshold() -> u32 {
    2
}

const fn default_open_log_interval_seconds() -> u64 {
    300
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_seconds: default_failure_window_seconds(),
            open_timeout_seconds: default_open_timeout_seconds(),
            half_open_after_seconds: default_half_open_after_seconds(),
            success_threshold: default_success_threshold(),
            open_log_interval_seconds: default_open_log_interval_seconds(),
        }
    }
}

/// Serializable breaker state for disk checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    /// Current state machine position.
    pub state: CircuitState,

    /// Failure timestamps inside the rolling window.
    pub failures: VecDeque<DateTime<Utc>>,

    /// When the circuit last opened.
    pub opened_at: Option<DateTime<Utc>>,

    /// Earliest time of the next OPEN status log line.
    pub next_log_at: Option<DateTime<Utc>>,

    /// Consecutive probe successes while HALF_OPEN.
    pub half_open_successes: u32,

    /// Whether the open alert fired for the current episode.
    pub alert_sent: bool,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            next_log_at: None,
            half_open_successes: 0,
            alert_sent: false,
        }
    }
}

/// Circuit breaker with CLOSED/OPEN/HALF_OPEN states.
///
/// All methods take `now` explicitly so transitions are deterministic in
/// tests; callers pass `Utc::now()`.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::default(),
        }
    }

    /// Restore a breaker from a checkpoint.
    #[must_use]
    pub fn restore(config: BreakerConfig, state: BreakerState) -> Self {
        Self { config, state }
    }

    /// Load a checkpoint from `path`, falling back to a closed breaker when
    /// the file is absent or unreadable.
    #[must_use]
    pub fn load_or_default(config: BreakerConfig, path: &Path) -> Self {
        match store::read_json::<BreakerState>(path) {
            Ok(Some(state)) => Self::restore(config, state),
            Ok(None) => Self::new(config),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "breaker checkpoint unreadable, starting closed");
                Self::new(config)
            },
        }
    }

    /// Persist the current state as a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on filesystem errors.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        store::write_json_atomic(path, &self.state)
    }

    /// Current state machine position.
    #[must_use]
    pub const fn state(&self) -> CircuitState {
        self.state.state
    }

    /// Failures currently inside the rolling window.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.state.failures.len()
    }

    fn window(&self) -> ChronoDuration {
        ChronoDuration::seconds(i64::try_from(self.config.failure_window_seconds).unwrap_or(0))
    }

    fn trim_failures(&mut self, now: DateTime<Utc>) {
        let window = self.window();
        while let Some(front) = self.state.failures.front() {
            if now.signed_duration_since(*front) > window {
                self.state.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.state == CircuitState::Open {
            return false;
        }
        self.state.state = CircuitState::Open;
        self.state.opened_at = Some(now);
        self.state.next_log_at = Some(now);
        self.state.half_open_successes = 0;
        self.state.alert_sent = false;
        true
    }

    fn half_open(&mut self, now: DateTime<Utc>) {
        self.state.state = CircuitState::HalfOpen;
        self.state.half_open_successes = 0;
        self.state.opened_at = Some(now);
        self.state.next_log_at = None;
    }

    fn close(&mut self) {
        self.state = BreakerState::default();
    }

    fn next_half_open_at(&self) -> Option<DateTime<Utc>> {
        let opened_at = self.state.opened_at?;
        let wait = self
            .config
            .half_open_after_seconds
            .min(self.config.open_timeout_seconds);
        Some(opened_at + ChronoDuration::seconds(i64::try_from(wait).unwrap_or(0)))
    }

    /// Seconds remaining until HALF_OPEN probes are allowed. Zero when the
    /// circuit is not open.
    #[must_use]
    pub fn seconds_until_half_open(&self, now: DateTime<Utc>) -> f64 {
        match self.next_half_open_at() {
            Some(target) => {
                let remaining = target.signed_duration_since(now);
                (remaining.num_milliseconds() as f64 / 1000.0).max(0.0)
            },
            None => 0.0,
        }
    }

    /// Whether a call may be attempted now.
    ///
    /// An OPEN circuit whose probe delay has elapsed transitions to
    /// HALF_OPEN and allows the call as a probe.
    pub fn allow_request(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.state != CircuitState::Open {
            return true;
        }
        if let Some(target) = self.next_half_open_at() {
            if now >= target {
                self.half_open(now);
                return true;
            }
        }
        false
    }

    /// Record a failed call.
    ///
    /// Returns `true` when this failure newly opened the circuit; the
    /// caller pairs that edge with [`Self::consume_open_alert`].
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.state == CircuitState::HalfOpen {
            // Probe failure: reopen with a fresh timer.
            return self.open(now);
        }
        self.state.failures.push_back(now);
        self.trim_failures(now);
        if self.state.state == CircuitState::Closed
            && self.state.failures.len() >= self.config.failure_threshold as usize
        {
            return self.open(now);
        }
        false
    }

    /// Record a successful call.
    ///
    /// Returns `true` when the circuit just closed.
    pub fn record_success(&mut self, _now: DateTime<Utc>) -> bool {
        if self.state.state != CircuitState::HalfOpen {
            return false;
        }
        self.state.half_open_successes += 1;
        if self.state.half_open_successes >= self.config.success_threshold {
            self.close();
            return true;
        }
        false
    }

    /// Whether an OPEN status line should be logged now. Rate-limited to one
    /// per `open_log_interval_seconds`; this is a log, not a retry.
    pub fn should_log_open_wait(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.state != CircuitState::Open {
            return false;
        }
        let due = self.state.next_log_at.map_or(true, |at| now >= at);
        if due {
            self.state.next_log_at = Some(
                now + ChronoDuration::seconds(
                    i64::try_from(self.config.open_log_interval_seconds).unwrap_or(0),
                ),
            );
        }
        due
    }

    /// Consume the one-shot alert for the current OPEN episode.
    ///
    /// Returns `true` exactly once per CLOSED→OPEN edge so alert storms
    /// cannot occur.
    pub fn consume_open_alert(&mut self) -> bool {
        if self.state.state != CircuitState::Open || self.state.alert_sent {
            return false;
        }
        self.state.alert_sent = true;
        true
    }

    /// Snapshot of the current state for checkpointing.
    #[must_use]
    pub fn checkpoint(&self) -> BreakerState {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            failure_window_seconds: 60,
            open_timeout_seconds: 120,
            half_open_after_seconds: 30,
            success_threshold: 2,
            open_log_interval_seconds: 10,
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn opens_after_threshold_failures_in_window() {
        let mut breaker = CircuitBreaker::new(config());
        assert!(!breaker.record_failure(at(0)));
        assert!(!breaker.record_failure(at(1)));
        assert!(breaker.record_failure(at(2)), "third failure opens");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request(at(3)));
    }

    #[test]
    fn failures_outside_window_do_not_trip() {
        let mut breaker = CircuitBreaker::new(config());
        breaker.record_failure(at(0));
        breaker.record_failure(at(1));
        // Third failure arrives after the first two rolled out of the window.
        assert!(!breaker.record_failure(at(120)));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[test]
    fn open_transitions_to_half_open_after_delay() {
        let mut breaker = CircuitBreaker::new(config());
        for i in 0..3 {
            breaker.record_failure(at(i));
        }
        assert!(!breaker.allow_request(at(10)));
        // half_open_after_seconds = 30, opened at t=2.
        assert!(breaker.allow_request(at(33)));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_probe_failure_reopens_with_reset_timer() {
        let mut breaker = CircuitBreaker::new(config());
        for i in 0..3 {
            breaker.record_failure(at(i));
        }
        assert!(breaker.allow_request(at(40)));
        assert!(breaker.record_failure(at(41)), "probe failure reopens");
        assert_eq!(breaker.state(), CircuitState::Open);
        // Timer restarted at t=41: not yet probing at t=60, probing at t=72.
        assert!(!breaker.allow_request(at(60)));
        assert!(breaker.allow_request(at(72)));
    }

    #[test]
    fn half_open_closes_after_consecutive_successes() {
        let mut breaker = CircuitBreaker::new(config());
        for i in 0..3 {
            breaker.record_failure(at(i));
        }
        assert!(breaker.allow_request(at(40)));
        assert!(!breaker.record_success(at(41)));
        assert!(breaker.record_success(at(42)), "second success closes");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn exactly_one_alert_per_open_episode() {
        let mut breaker = CircuitBreaker::new(config());
        for i in 0..3 {
            breaker.record_failure(at(i));
        }
        assert!(breaker.consume_open_alert());
        assert!(!breaker.consume_open_alert(), "alert must not repeat");

        // Re-opening after a failed probe arms a new alert.
        assert!(breaker.allow_request(at(40)));
        breaker.record_failure(at(41));
        assert!(breaker.consume_open_alert());
    }

    #[test]
    fn open_log_is_rate_limited() {
        let mut breaker = CircuitBreaker::new(config());
        for i in 0..3 {
            breaker.record_failure(at(i));
        }
        assert!(breaker.should_log_open_wait(at(3)));
        assert!(!breaker.should_log_open_wait(at(5)));
        assert!(breaker.should_log_open_wait(at(14)));
    }

    #[test]
    fn checkpoint_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker_state.json");

        let mut breaker = CircuitBreaker::new(config());
        for i in 0..3 {
            breaker.record_failure(at(i));
        }
        breaker.save(&path).unwrap();

        let restored = CircuitBreaker::load_or_default(config(), &path);
        assert_eq!(restored.state(), CircuitState::Open);
        assert_eq!(restored.checkpoint(), breaker.checkpoint());
    }

    #[test]
    fn missing_checkpoint_starts_closed() {
        let dir = tempfile::tempdir().unwrap();
        let breaker =
            CircuitBreaker::load_or_default(config(), &dir.path().join("nonexistent.json"));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
