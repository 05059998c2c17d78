//! Outbound identity rotation.
//!
//! An identity is a proxy endpoint plus a client signature (user-agent). The
//! pool always ends in a permanent "direct" identity with no proxy, so
//! [`IdentityRotator::next_identity`] can never come back empty: once every
//! non-direct identity is dead the rotator falls back to direct permanently
//! and emits one alert.
//!
//! Identities are validated against a stable reference endpoint before first
//! use in a session, accumulate consecutive failures, and are marked dead at
//! the configured threshold. Dead identities are excluded from rotation but
//! never deleted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Default user-agent for the direct identity.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; vigil/0.1)";

/// Name of the permanent direct identity.
pub const DIRECT_IDENTITY_NAME: &str = "direct";

/// Consecutive failures before an identity is marked dead.
const fn default_failure_threshold() -> u32 {
    3
}

const fn default_rotation_every_n() -> u32 {
    1
}

const fn default_validation_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Pool operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    /// Direct connections only; the identity list is ignored.
    Direct,

    /// Rotate through the configured identities.
    Rotator,
}

impl Default for PoolMode {
    fn default() -> Self {
        Self::Direct
    }
}

/// Rotation strategy over active identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// Cycle through identities in order.
    RoundRobin,

    /// Pick a random active identity.
    Random,
}

impl Default for RotationStrategy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

/// One configured identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityEntry {
    /// Unique identity name.
    pub name: String,

    /// Proxy endpoint URL; `None` means a direct connection.
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// Client signature sent as the User-Agent header.
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Identity pool configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityPoolConfig {
    /// Pool operating mode.
    #[serde(default)]
    pub mode: PoolMode,

    /// Rotation strategy.
    #[serde(default)]
    pub rotation_strategy: RotationStrategy,

    /// Requests served by an identity before rotating to the next one.
    #[serde(default = "default_rotation_every_n")]
    pub rotation_every_n: u32,

    /// Consecutive failures before an identity is marked dead.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Timeout for the validation probe.
    #[serde(default = "default_validation_timeout")]
    #[serde(with = "crate::config::humantime_serde")]
    pub validation_timeout: Duration,

    /// Stable reference endpoint probed before first use in a session.
    #[serde(default)]
    pub validation_url: Option<String>,

    /// Configured identities, in rotation order.
    #[serde(default)]
    pub identities: Vec<IdentityEntry>,
}

impl Default for IdentityPoolConfig {
    fn default() -> Self {
        Self {
            mode: PoolMode::default(),
            rotation_strategy: RotationStrategy::default(),
            rotation_every_n: default_rotation_every_n(),
            failure_threshold: default_failure_threshold(),
            validation_timeout: default_validation_timeout(),
            validation_url: None,
            identities: Vec::new(),
        }
    }
}

impl IdentityPoolConfig {
    /// Validate invariants the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` on out-of-range values or duplicate
    /// identity names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rotation_every_n < 1 {
            return Err(ConfigError::Validation(
                "rotation_every_n must be >= 1".to_string(),
            ));
        }
        if self.failure_threshold < 1 {
            return Err(ConfigError::Validation(
                "failure_threshold must be >= 1".to_string(),
            ));
        }
        let mut names: Vec<&str> = self
            .identities
            .iter()
            .map(|entry| entry.name.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.identities.len() {
            return Err(ConfigError::Validation(
                "identity names must be unique".to_string(),
            ));
        }
        if names.contains(&DIRECT_IDENTITY_NAME) {
            return Err(ConfigError::Validation(format!(
                "'{DIRECT_IDENTITY_NAME}' is reserved for the built-in fallback identity"
            )));
        }
        Ok(())
    }
}

/// Health of a pooled identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityState {
    /// Healthy and in rotation.
    Active,

    /// One failure away from being marked dead.
    Degraded,

    /// Excluded from rotation; never deleted.
    Dead,
}

/// Identity handed to the orchestrator for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Identity name, used to report success/failure back to the rotator.
    pub name: String,

    /// Proxy endpoint, if any.
    pub proxy_url: Option<String>,

    /// User-Agent header value.
    pub user_agent: String,
}

#[derive(Debug)]
struct IdentitySlot {
    identity: Identity,
    consecutive_failures: u32,
    state: IdentityState,
    last_error: Option<String>,
}

impl IdentitySlot {
    fn is_active(&self) -> bool {
        self.state != IdentityState::Dead
    }
}

/// Health summary of one pooled identity, for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityStatus {
    /// Identity name.
    pub name: String,

    /// Current health state.
    pub state: IdentityState,

    /// Consecutive failure count.
    pub consecutive_failures: u32,

    /// Most recent failure reason, if any.
    pub last_error: Option<String>,
}

/// Errors from the identity subsystem.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// HTTP client construction failed for an identity.
    #[error("failed to build client for identity {name}: {source}")]
    Client {
        /// Identity name.
        name: String,
        /// Underlying reqwest error.
        source: reqwest::Error,
    },
}

/// Supplies an outbound identity per attempt.
#[derive(Debug)]
pub struct IdentityRotator {
    mode: PoolMode,
    strategy: RotationStrategy,
    rotation_every_n: u32,
    failure_threshold: u32,
    validation_timeout: Duration,
    validation_url: Option<String>,
    slots: Vec<IdentitySlot>,
    direct: Identity,
    cursor: usize,
    requests_since_rotation: u32,
    current: Option<usize>,
    direct_fallback: bool,
    fallback_alert_pending: bool,
}

impl IdentityRotator {
    /// Build a rotator from a validated pool configuration.
    #[must_use]
    pub fn new(config: &IdentityPoolConfig) -> Self {
        let slots = config
            .identities
            .iter()
            .map(|entry| IdentitySlot {
                identity: Identity {
                    name: entry.name.clone(),
                    proxy_url: entry.proxy_url.clone(),
                    user_agent: entry
                        .user_agent
                        .clone()
                        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
                },
                consecutive_failures: 0,
                state: IdentityState::Active,
                last_error: None,
            })
            .collect();

        Self {
            mode: config.mode,
            strategy: config.rotation_strategy,
            rotation_every_n: config.rotation_every_n.max(1),
            failure_threshold: config.failure_threshold.max(1),
            validation_timeout: config.validation_timeout,
            validation_url: config.validation_url.clone(),
            slots,
            direct: Identity {
                name: DIRECT_IDENTITY_NAME.to_string(),
                proxy_url: None,
                user_agent: DEFAULT_USER_AGENT.to_string(),
            },
            cursor: 0,
            requests_since_rotation: 0,
            current: None,
            direct_fallback: false,
            fallback_alert_pending: false,
        }
    }

    /// Number of identities still in rotation (excluding direct).
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_active()).count()
    }

    /// Whether the rotator has permanently fallen back to direct.
    #[must_use]
    pub const fn is_direct_fallback(&self) -> bool {
        self.direct_fallback
    }

    /// Health summary of every pooled identity.
    #[must_use]
    pub fn statuses(&self) -> Vec<IdentityStatus> {
        self.slots
            .iter()
            .map(|slot| IdentityStatus {
                name: slot.identity.name.clone(),
                state: slot.state,
                consecutive_failures: slot.consecutive_failures,
                last_error: slot.last_error.clone(),
            })
            .collect()
    }

    fn fall_back_to_direct(&mut self) {
        if !self.direct_fallback {
            tracing::warn!(reason = "no_active_identities", "identity_fallback_direct");
            self.direct_fallback = true;
            self.fallback_alert_pending = true;
        }
        self.current = None;
    }

    fn select_next(&mut self) -> Option<usize> {
        let active: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_active())
            .map(|(index, _)| index)
            .collect();
        if active.is_empty() {
            self.fall_back_to_direct();
            return None;
        }
        match self.strategy {
            RotationStrategy::Random => {
                let pick = rand::random::<u64>() as usize % active.len();
                Some(active[pick])
            },
            RotationStrategy::RoundRobin => {
                if self.cursor >= active.len() {
                    self.cursor = 0;
                }
                let index = active[self.cursor];
                self.cursor = (self.cursor + 1) % active.len();
                Some(index)
            },
        }
    }

    /// Return the identity for the next attempt. Never empty: direct mode,
    /// exhausted pools, and permanent fallback all yield the direct
    /// identity.
    pub fn next_identity(&mut self) -> Identity {
        if self.mode == PoolMode::Direct || self.direct_fallback {
            return self.direct.clone();
        }
        if self.active_count() == 0 {
            self.fall_back_to_direct();
            return self.direct.clone();
        }

        self.requests_since_rotation += 1;
        let must_rotate = self.current.is_none()
            || self
                .current
                .map(|index| !self.slots[index].is_active())
                .unwrap_or(true)
            || self.requests_since_rotation >= self.rotation_every_n;
        if must_rotate {
            self.current = self.select_next();
            self.requests_since_rotation = 0;
        }

        match self.current {
            Some(index) => self.slots[index].identity.clone(),
            None => self.direct.clone(),
        }
    }

    /// Force rotation before the next attempt (e.g. after a 403/429).
    pub fn force_rotation(&mut self) {
        self.requests_since_rotation = self.rotation_every_n;
    }

    /// Report a successful request through `name`.
    pub fn mark_success(&mut self, name: &str) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.identity.name == name) {
            slot.consecutive_failures = 0;
            slot.last_error = None;
            if slot.state != IdentityState::Dead {
                slot.state = IdentityState::Active;
            }
        }
    }

    /// Report a failed request through `name`.
    ///
    /// Accumulating `failure_threshold` consecutive failures marks the
    /// identity dead and removes it from rotation.
    pub fn mark_failure(&mut self, name: &str, reason: &str) {
        let threshold = self.failure_threshold;
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.identity.name == name) {
            slot.consecutive_failures += 1;
            slot.last_error = Some(reason.to_string());
            if slot.consecutive_failures >= threshold {
                if slot.state != IdentityState::Dead {
                    tracing::warn!(
                        identity = %slot.identity.name,
                        reason = %reason,
                        "identity_marked_dead"
                    );
                }
                slot.state = IdentityState::Dead;
            } else if slot.consecutive_failures + 1 >= threshold {
                slot.state = IdentityState::Degraded;
            }
        }
        if self.mode == PoolMode::Rotator && self.active_count() == 0 {
            self.fall_back_to_direct();
        }
    }

    /// Consume the one-shot alert armed when the pool fell back to direct.
    pub fn consume_fallback_alert(&mut self) -> bool {
        std::mem::take(&mut self.fallback_alert_pending)
    }

    /// Probe every identity against the validation endpoint before first
    /// use in a session. Probe failures count as identity failures up to the
    /// death threshold. Returns the number of identities still active.
    ///
    /// No-op (returning the active count) when no validation URL is
    /// configured or the pool is direct-only.
    ///
    /// # Errors
    ///
    /// Returns `IdentityError::Client` when an HTTP client cannot be built
    /// for an identity; probe request failures are recorded, not returned.
    pub fn validate_pool(&mut self) -> Result<usize, IdentityError> {
        let Some(url) = self.validation_url.clone() else {
            return Ok(self.active_count());
        };
        if self.mode == PoolMode::Direct {
            return Ok(self.active_count());
        }

        let names: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| slot.is_active())
            .map(|slot| slot.identity.name.clone())
            .collect();

        for name in names {
            let Some(identity) = self
                .slots
                .iter()
                .find(|slot| slot.identity.name == name)
                .map(|slot| slot.identity.clone())
            else {
                continue;
            };
            let client = build_client(&identity, self.validation_timeout).map_err(|source| {
                IdentityError::Client {
                    name: identity.name.clone(),
                    source,
                }
            })?;

            match client.get(&url).send() {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(identity = %name, "identity_validation_ok");
                    self.mark_success(&name);
                },
                Ok(response) => {
                    let status = response.status().as_u16();
                    tracing::warn!(identity = %name, status, "identity_validation_failed");
                    // A probe rejection is as disqualifying as the threshold.
                    for _ in 0..self.failure_threshold {
                        self.mark_failure(&name, &format!("validation_status={status}"));
                    }
                },
                Err(err) => {
                    tracing::warn!(identity = %name, error = %err, "identity_validation_error");
                    for _ in 0..self.failure_threshold {
                        self.mark_failure(&name, &format!("validation_error={err}"));
                    }
                },
            }
        }
        Ok(self.active_count())
    }
}

/// Build a blocking HTTP client for an identity, honoring its proxy.
///
/// # Errors
///
/// Returns the underlying reqwest error when the proxy URL is invalid or
/// the client cannot be initialized.
pub fn build_client(
    identity: &Identity,
    timeout: Duration,
) -> Result<reqwest::blocking::Client, reqwest::Error> {
    let mut builder = reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(15).min(timeout))
        .timeout(timeout)
        .user_agent(identity.user_agent.clone());
    if let Some(proxy_url) = &identity.proxy_url {
        builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_config(identities: &[(&str, Option<&str>)]) -> IdentityPoolConfig {
        IdentityPoolConfig {
            mode: PoolMode::Rotator,
            rotation_strategy: RotationStrategy::RoundRobin,
            rotation_every_n: 1,
            failure_threshold: 3,
            identities: identities
                .iter()
                .map(|(name, proxy)| IdentityEntry {
                    name: (*name).to_string(),
                    proxy_url: proxy.map(str::to_string),
                    user_agent: None,
                })
                .collect(),
            ..IdentityPoolConfig::default()
        }
    }

    #[test]
    fn direct_mode_always_yields_direct() {
        let mut rotator = IdentityRotator::new(&IdentityPoolConfig::default());
        let identity = rotator.next_identity();
        assert_eq!(identity.name, DIRECT_IDENTITY_NAME);
        assert!(identity.proxy_url.is_none());
    }

    #[test]
    fn round_robin_cycles_through_pool() {
        let config = pool_config(&[
            ("a", Some("http://proxy-a:8080")),
            ("b", Some("http://proxy-b:8080")),
        ]);
        let mut rotator = IdentityRotator::new(&config);
        let first = rotator.next_identity();
        let second = rotator.next_identity();
        let third = rotator.next_identity();
        assert_ne!(first.name, second.name);
        assert_eq!(first.name, third.name);
    }

    #[test]
    fn rotation_every_n_holds_identity_between_rotations() {
        let mut config = pool_config(&[
            ("a", Some("http://proxy-a:8080")),
            ("b", Some("http://proxy-b:8080")),
        ]);
        config.rotation_every_n = 3;
        let mut rotator = IdentityRotator::new(&config);
        let first = rotator.next_identity();
        assert_eq!(rotator.next_identity().name, first.name);
        assert_eq!(rotator.next_identity().name, first.name);
        assert_ne!(rotator.next_identity().name, first.name);
    }

    #[test]
    fn force_rotation_switches_immediately() {
        let mut config = pool_config(&[
            ("a", Some("http://proxy-a:8080")),
            ("b", Some("http://proxy-b:8080")),
        ]);
        config.rotation_every_n = 10;
        let mut rotator = IdentityRotator::new(&config);
        let first = rotator.next_identity();
        rotator.force_rotation();
        assert_ne!(rotator.next_identity().name, first.name);
    }

    #[test]
    fn identity_dies_after_threshold_failures() {
        let config = pool_config(&[("a", Some("http://proxy-a:8080"))]);
        let mut rotator = IdentityRotator::new(&config);
        rotator.mark_failure("a", "connect reset");
        rotator.mark_failure("a", "connect reset");
        assert_eq!(rotator.active_count(), 1);
        rotator.mark_failure("a", "connect reset");
        assert_eq!(rotator.active_count(), 0);
        assert!(rotator.is_direct_fallback());

        let status = &rotator.statuses()[0];
        assert_eq!(status.state, IdentityState::Dead);
        assert_eq!(status.consecutive_failures, 3);
        assert_eq!(status.last_error.as_deref(), Some("connect reset"));
    }

    #[test]
    fn success_resets_failure_count() {
        let config = pool_config(&[("a", Some("http://proxy-a:8080"))]);
        let mut rotator = IdentityRotator::new(&config);
        rotator.mark_failure("a", "timeout");
        rotator.mark_failure("a", "timeout");
        rotator.mark_success("a");
        rotator.mark_failure("a", "timeout");
        assert_eq!(rotator.active_count(), 1, "reset count must survive one failure");
    }

    #[test]
    fn exhausted_pool_falls_back_to_direct_with_one_alert() {
        let config = pool_config(&[
            ("a", Some("http://proxy-a:8080")),
            ("b", Some("http://proxy-b:8080")),
        ]);
        let mut rotator = IdentityRotator::new(&config);
        for name in ["a", "b"] {
            for _ in 0..3 {
                rotator.mark_failure(name, "refused");
            }
        }
        // Every subsequent call returns direct, never empty.
        for _ in 0..5 {
            assert_eq!(rotator.next_identity().name, DIRECT_IDENTITY_NAME);
        }
        assert!(rotator.consume_fallback_alert());
        assert!(!rotator.consume_fallback_alert(), "alert is one-shot");
    }

    #[test]
    fn dead_identities_are_skipped_in_rotation() {
        let config = pool_config(&[
            ("a", Some("http://proxy-a:8080")),
            ("b", Some("http://proxy-b:8080")),
        ]);
        let mut rotator = IdentityRotator::new(&config);
        for _ in 0..3 {
            rotator.mark_failure("a", "refused");
        }
        for _ in 0..4 {
            assert_eq!(rotator.next_identity().name, "b");
        }
    }

    #[test]
    fn config_validation_rejects_reserved_and_duplicate_names() {
        let mut config = pool_config(&[("a", None), ("a", None)]);
        assert!(config.validate().is_err());

        config = pool_config(&[("direct", None)]);
        assert!(config.validate().is_err());

        config = pool_config(&[("a", None), ("b", None)]);
        assert!(config.validate().is_ok());
    }
}
