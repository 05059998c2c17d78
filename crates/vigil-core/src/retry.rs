//! Retry policy resolution and backoff computation.
//!
//! Policies are pure decision tables: given an outcome classification (HTTP
//! status, transport error kind, or payload parse failure) and a 0-based
//! attempt index, [`RetryConfig::decide`] returns either the wait before the
//! next attempt or a give-up reason. No I/O happens here; the caller
//! performs the sleep.
//!
//! Resolution precedence for statuses: exact key (`"429"`) over class key
//! (`"5xx"`, `"4xx"`) over the `other_status` policy over the default.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default hard per-request timeout.
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 30.0;

/// What to do when a matching outcome is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAction {
    /// Retry per the backoff schedule.
    Retry,

    /// No further retries; the caller must surface the failure immediately
    /// through its alert hook.
    AlertOnly,

    /// No further retries and no alert requirement.
    FailFast,
}

impl Default for RetryAction {
    fn default() -> Self {
        Self::Retry
    }
}

/// Jitter configuration: either a single fraction or an explicit range.
///
/// A scalar `jitter = 0.2` is shorthand for `min = 0.2, max = 0.2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Jitter {
    /// Fixed jitter fraction.
    Fraction(f64),

    /// Uniformly-drawn jitter fraction range.
    Range {
        /// Lower bound of the fraction.
        min: f64,
        /// Upper bound of the fraction.
        max: f64,
    },
}

impl Default for Jitter {
    fn default() -> Self {
        Self::Fraction(0.0)
    }
}

impl Jitter {
    /// The `(min, max)` fraction bounds.
    #[must_use]
    pub fn bounds(self) -> (f64, f64) {
        match self {
            Self::Fraction(f) => (f, f),
            Self::Range { min, max } => (min, max),
        }
    }
}

/// Retry policy for one outcome class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Maximum number of attempts before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay in seconds for the exponential schedule.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,

    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on the computed delay, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,

    /// Jitter fraction applied to the capped delay.
    #[serde(default)]
    pub jitter: Jitter,

    /// Action taken when this policy matches.
    #[serde(default)]
    pub action: RetryAction,
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_backoff_base() -> f64 {
    2.0
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_max_delay() -> f64 {
    300.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay: default_max_delay(),
            jitter: Jitter::default(),
            action: RetryAction::default(),
        }
    }
}

impl RetryPolicy {
    /// Compute the wait before the retry following 0-based attempt `n`.
    ///
    /// `t_n = min(backoff_base * multiplier^n, max_delay)`, then a jitter
    /// multiplier drawn as `m ~ U(1-f, 1+f)` with `f ~ U(jitter_min,
    /// jitter_max)`. Zero jitter returns the capped exponential exactly.
    #[must_use]
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let exponential = self.backoff_base * self.backoff_multiplier.powi(exponent);
        let capped = exponential.min(self.max_delay).max(0.0);

        let (jitter_min, jitter_max) = self.jitter.bounds();
        if jitter_max <= 0.0 {
            return Duration::from_secs_f64(capped);
        }
        let jitter_min = jitter_min.clamp(0.0, jitter_max);
        let mut rng = rand::thread_rng();
        let fraction = rng.gen_range(jitter_min..=jitter_max);
        let multiplier = rng.gen_range((1.0 - fraction)..=(1.0 + fraction));
        Duration::from_secs_f64((capped * multiplier).max(0.0))
    }
}

/// Transport-level failure kinds used for per-exception policy lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// The request timed out.
    Timeout,

    /// Connection could not be established or was reset.
    Connect,

    /// Any other transport failure.
    Other,
}

impl TransportKind {
    /// Configuration key for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Other => "other",
        }
    }
}

/// Classification of one attempt's failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Non-success HTTP status.
    Status(u16),

    /// Transport failure before a response was received.
    Transport(TransportKind),

    /// Response received but the payload failed to parse.
    Parse,
}

/// Configuration key used for parse failures in `per_exception`.
pub const PARSE_EXCEPTION_KEY: &str = "parse";

/// Why a retry sequence gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// `max_attempts` exhausted.
    AttemptsExhausted,

    /// Policy action was `alert_only`; failure must be surfaced now.
    AlertOnly,

    /// Policy action was `fail_fast`.
    FailFast,
}

/// Decision for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Sleep this long, then retry.
    RetryAfter(Duration),

    /// Stop retrying.
    GiveUp(GiveUpReason),
}

/// Runtime retry configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Fallback policy when nothing more specific matches.
    #[serde(default)]
    pub default: RetryPolicy,

    /// Policies keyed by exact status (`"429"`) or class (`"5xx"`, `"4xx"`).
    #[serde(default)]
    pub per_status: BTreeMap<String, RetryPolicy>,

    /// Policies keyed by transport/parse kind (`"timeout"`, `"connect"`,
    /// `"other"`, `"parse"`).
    #[serde(default)]
    pub per_exception: BTreeMap<String, RetryPolicy>,

    /// Policy for statuses with no exact or class match.
    #[serde(default)]
    pub other_status: Option<RetryPolicy>,

    /// Hard per-request timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,

    /// Override path of the durable failure log.
    #[serde(default)]
    pub failed_requests_path: Option<PathBuf>,

    /// Idempotency window: a repeated capture for the same source inside
    /// this many seconds is suppressed. Zero disables the window.
    #[serde(default)]
    pub recent_snapshot_seconds: u64,

    /// Truncation cap for response bodies copied into logs and failure
    /// records.
    #[serde(default = "default_log_payload_bytes")]
    pub log_payload_bytes: usize,
}

const fn default_timeout_seconds() -> f64 {
    DEFAULT_TIMEOUT_SECONDS
}

const fn default_log_payload_bytes() -> usize {
    2_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default: RetryPolicy::default(),
            per_status: BTreeMap::new(),
            per_exception: BTreeMap::new(),
            other_status: None,
            timeout_seconds: default_timeout_seconds(),
            failed_requests_path: None,
            recent_snapshot_seconds: 0,
            log_payload_bytes: default_log_payload_bytes(),
        }
    }
}

impl RetryConfig {
    /// Resolve the policy for an HTTP status code.
    ///
    /// Exact match first, then class (`5xx`/`4xx`), then `other_status`,
    /// then the default.
    #[must_use]
    pub fn policy_for_status(&self, status: u16) -> &RetryPolicy {
        if let Some(policy) = self.per_status.get(&status.to_string()) {
            return policy;
        }
        if (500..=599).contains(&status) {
            if let Some(policy) = self.per_status.get("5xx") {
                return policy;
            }
        }
        if (400..=499).contains(&status) {
            if let Some(policy) = self.per_status.get("4xx") {
                return policy;
            }
        }
        self.other_status.as_ref().unwrap_or(&self.default)
    }

    /// Resolve the policy for an outcome classification.
    #[must_use]
    pub fn policy_for_outcome(&self, outcome: &Outcome) -> &RetryPolicy {
        match outcome {
            Outcome::Status(status) => self.policy_for_status(*status),
            Outcome::Transport(kind) => self
                .per_exception
                .get(kind.as_str())
                .unwrap_or(&self.default),
            Outcome::Parse => self
                .per_exception
                .get(PARSE_EXCEPTION_KEY)
                .unwrap_or(&self.default),
        }
    }

    /// Decide what to do after 0-based attempt `attempt` failed with
    /// `outcome`.
    #[must_use]
    pub fn decide(&self, outcome: &Outcome, attempt: u32) -> Decision {
        let policy = self.policy_for_outcome(outcome);
        match policy.action {
            RetryAction::AlertOnly => Decision::GiveUp(GiveUpReason::AlertOnly),
            RetryAction::FailFast => Decision::GiveUp(GiveUpReason::FailFast),
            RetryAction::Retry => {
                if attempt.saturating_add(1) >= policy.max_attempts {
                    Decision::GiveUp(GiveUpReason::AttemptsExhausted)
                } else {
                    Decision::RetryAfter(policy.compute_delay(attempt))
                }
            },
        }
    }

    /// The hard per-request timeout as a `Duration`.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn zero_jitter_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            backoff_base: 2.0,
            backoff_multiplier: 2.0,
            max_delay: 300.0,
            jitter: Jitter::Fraction(0.0),
            action: RetryAction::Retry,
        }
    }

    #[test]
    fn delay_schedule_doubles_then_caps() {
        let policy = RetryPolicy {
            max_delay: 60.0,
            ..zero_jitter_policy()
        };
        assert_eq!(policy.compute_delay(0), Duration::from_secs(2));
        assert_eq!(policy.compute_delay(1), Duration::from_secs(4));
        assert_eq!(policy.compute_delay(2), Duration::from_secs(8));
        assert_eq!(policy.compute_delay(3), Duration::from_secs(16));
        assert_eq!(policy.compute_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_configured_bounds() {
        let policy = RetryPolicy {
            backoff_base: 10.0,
            backoff_multiplier: 1.0,
            jitter: Jitter::Range { min: 0.2, max: 0.5 },
            ..zero_jitter_policy()
        };
        for _ in 0..200 {
            let delay = policy.compute_delay(0).as_secs_f64();
            assert!((5.0..=15.0).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn status_resolution_prefers_exact_then_class() {
        let mut config = RetryConfig::default();
        config.per_status.insert(
            "429".to_string(),
            RetryPolicy {
                max_attempts: 7,
                ..RetryPolicy::default()
            },
        );
        config.per_status.insert(
            "5xx".to_string(),
            RetryPolicy {
                max_attempts: 3,
                ..RetryPolicy::default()
            },
        );
        config.other_status = Some(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        });

        assert_eq!(config.policy_for_status(429).max_attempts, 7);
        assert_eq!(config.policy_for_status(503).max_attempts, 3);
        // 3xx falls through to other_status.
        assert_eq!(config.policy_for_status(301).max_attempts, 1);
    }

    #[test]
    fn alert_only_gives_up_regardless_of_attempt() {
        let mut config = RetryConfig::default();
        config.per_status.insert(
            "403".to_string(),
            RetryPolicy {
                action: RetryAction::AlertOnly,
                max_attempts: 10,
                ..RetryPolicy::default()
            },
        );
        assert_eq!(
            config.decide(&Outcome::Status(403), 0),
            Decision::GiveUp(GiveUpReason::AlertOnly)
        );
    }

    #[test]
    fn transport_kinds_resolve_through_per_exception() {
        let mut config = RetryConfig::default();
        config.per_exception.insert(
            "timeout".to_string(),
            RetryPolicy {
                max_attempts: 9,
                ..RetryPolicy::default()
            },
        );
        let policy = config.policy_for_outcome(&Outcome::Transport(TransportKind::Timeout));
        assert_eq!(policy.max_attempts, 9);
        // Unconfigured kinds fall back to the default.
        let policy = config.policy_for_outcome(&Outcome::Transport(TransportKind::Connect));
        assert_eq!(policy.max_attempts, config.default.max_attempts);
    }

    #[test]
    fn rate_limited_source_exhausts_after_five_attempts() {
        // Policy {max_attempts: 5, base: 2, multiplier: 2, max_delay: 300,
        // jitter: 0} against a source returning 429 on every attempt: the
        // retry waits are 2, 4, 8, 16 and the fifth attempt gives up.
        let config = RetryConfig {
            default: zero_jitter_policy(),
            ..RetryConfig::default()
        };
        let outcome = Outcome::Status(429);

        let expected = [2u64, 4, 8, 16];
        for (attempt, want) in expected.iter().enumerate() {
            match config.decide(&outcome, u32::try_from(attempt).unwrap()) {
                Decision::RetryAfter(delay) => {
                    assert_eq!(delay, Duration::from_secs(*want));
                },
                Decision::GiveUp(_) => panic!("attempt {attempt} should retry"),
            }
        }
        assert_eq!(
            config.decide(&outcome, 4),
            Decision::GiveUp(GiveUpReason::AttemptsExhausted)
        );
    }

    #[test]
    fn scalar_jitter_parses_as_fraction() {
        let config: RetryConfig = toml::from_str(
            r#"
                [default]
                jitter = 0.25
            "#,
        )
        .unwrap();
        assert_eq!(config.default.jitter.bounds(), (0.25, 0.25));

        let config: RetryConfig = toml::from_str(
            r#"
                [default]
                jitter = { min = 0.1, max = 0.4 }
            "#,
        )
        .unwrap();
        assert_eq!(config.default.jitter.bounds(), (0.1, 0.4));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<RetryConfig, _> = toml::from_str("surprise = true");
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn delay_is_monotonic_and_capped(
            base in 0.1f64..10.0,
            multiplier in 1.0f64..4.0,
            max_delay in 1.0f64..600.0,
            attempt in 0u32..24,
        ) {
            let policy = RetryPolicy {
                max_attempts: 100,
                backoff_base: base,
                backoff_multiplier: multiplier,
                max_delay,
                jitter: Jitter::Fraction(0.0),
                action: RetryAction::Retry,
            };
            let current = policy.compute_delay(attempt);
            let next = policy.compute_delay(attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(current.as_secs_f64() <= max_delay + 1e-9);
        }
    }
}
