//! Independent liveness supervisor for the acquisition loop.
//!
//! The watchdog ticks on its own schedule and reads only on-disk state
//! (the heartbeat file, snapshot ages, log sizes, and lock files), so it
//! never blocks on the orchestrator's network I/O. A check must stay
//! failed through the grace window before the watchdog acts; restarts are
//! bounded by a rolling window with a cooldown, and exhausting the bound
//! escalates to a human-facing alert instead of restarting again.
//!
//! Watchdog state persists across supervisor restarts so attempt counters
//! are not forgotten by a crash.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::humantime_serde;
use crate::lockfile;
use crate::shutdown::Shutdown;
use crate::store::{self, Layout, SnapshotStore, StoreError};

/// Watchdog configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchdogConfig {
    /// Supervisory tick interval.
    #[serde(default = "default_check_interval")]
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,

    /// Maximum tolerated age of the newest snapshot.
    #[serde(default = "default_max_inactivity")]
    #[serde(with = "humantime_serde")]
    pub max_inactivity: Duration,

    /// Maximum tolerated heartbeat age.
    #[serde(default = "default_heartbeat_timeout")]
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// How long a check must stay failed before the watchdog acts.
    #[serde(default = "default_failure_grace")]
    #[serde(with = "humantime_serde")]
    pub failure_grace: Duration,

    /// Minimum spacing between actions.
    #[serde(default = "default_action_cooldown")]
    #[serde(with = "humantime_serde")]
    pub action_cooldown: Duration,

    /// How long to wait for the restart command to finish.
    #[serde(default = "default_restart_timeout")]
    #[serde(with = "humantime_serde")]
    pub restart_timeout: Duration,

    /// Restart attempts allowed inside the rolling window.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Rolling window for counting restart attempts.
    #[serde(default = "default_restart_window")]
    #[serde(with = "humantime_serde")]
    pub restart_window: Duration,

    /// Lock files to monitor for staleness. Empty means the layout's lock
    /// directory is scanned instead.
    #[serde(default)]
    pub lock_files: Vec<PathBuf>,

    /// Lock age beyond which a holder is presumed deadlocked.
    #[serde(default = "default_lock_timeout")]
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// Log file whose size and growth rate are monitored.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Maximum tolerated log size in bytes.
    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,

    /// Maximum tolerated log growth in bytes per minute (runaway-loop
    /// detector).
    #[serde(default = "default_max_log_growth_bytes_per_min")]
    pub max_log_growth_bytes_per_min: u64,

    /// Webhook URLs receiving watchdog alerts.
    #[serde(default)]
    pub alert_urls: Vec<String>,

    /// Command relaunching the acquisition process; empty disables
    /// restarts and escalates directly.
    #[serde(default)]
    pub restart_command: Vec<String>,
}

const fn default_check_interval() -> Duration {
    Duration::from_secs(240)
}

const fn default_max_inactivity() -> Duration {
    Duration::from_secs(1800)
}

const fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(900)
}

const fn default_failure_grace() -> Duration {
    Duration::from_secs(600)
}

const fn default_action_cooldown() -> Duration {
    Duration::from_secs(1800)
}

const fn default_restart_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_restart_window() -> Duration {
    Duration::from_secs(3600)
}

const fn default_lock_timeout() -> Duration {
    Duration::from_secs(1800)
}

const fn default_max_log_size_bytes() -> u64 {
    256 * 1024 * 1024
}

const fn default_max_log_growth_bytes_per_min() -> u64 {
    20 * 1024 * 1024
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            max_inactivity: default_max_inactivity(),
            heartbeat_timeout: default_heartbeat_timeout(),
            failure_grace: default_failure_grace(),
            action_cooldown: default_action_cooldown(),
            restart_timeout: default_restart_timeout(),
            max_attempts: default_max_attempts(),
            restart_window: default_restart_window(),
            lock_files: Vec::new(),
            lock_timeout: default_lock_timeout(),
            log_path: None,
            max_log_size_bytes: default_max_log_size_bytes(),
            max_log_growth_bytes_per_min: default_max_log_growth_bytes_per_min(),
            alert_urls: Vec::new(),
            restart_command: Vec::new(),
        }
    }
}

/// Tracked failure of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    /// When the check first failed.
    pub first_seen: DateTime<Utc>,

    /// When the check last failed.
    pub last_seen: DateTime<Utc>,

    /// Latest failure reason.
    pub reason: String,
}

/// Log-size sample from the previous tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSample {
    /// Observed size in bytes.
    pub size_bytes: u64,

    /// When the sample was taken.
    pub sampled_at: DateTime<Utc>,
}

/// Persisted watchdog state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogState {
    /// Failed checks keyed by check name.
    #[serde(default)]
    pub failures: BTreeMap<String, FailureEntry>,

    /// When the watchdog last acted.
    #[serde(default)]
    pub last_action: Option<DateTime<Utc>>,

    /// Restart timestamps inside the rolling window.
    #[serde(default)]
    pub restart_history: Vec<DateTime<Utc>>,

    /// Log-size sample from the previous tick.
    #[serde(default)]
    pub log_sample: Option<LogSample>,

    /// Whether the escalation alert already fired for the current episode.
    #[serde(default)]
    pub escalated: bool,
}

/// What one tick did, for observability and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Checks that failed this tick, as `(name, reason)` pairs.
    pub failed_checks: Vec<(String, String)>,

    /// Whether a restart was triggered.
    pub restarted: bool,

    /// Whether the tick escalated to a human-facing alert.
    pub escalated: bool,
}

/// Errors from the watchdog.
#[derive(Debug, Error)]
pub enum WatchdogError {
    /// State persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct CheckResult {
    name: &'static str,
    ok: bool,
    reason: String,
}

impl CheckResult {
    fn ok(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name,
            ok: true,
            reason: reason.into(),
        }
    }

    fn failed(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name,
            ok: false,
            reason: reason.into(),
        }
    }
}

/// Liveness supervisor over the shared on-disk layout.
pub struct Watchdog {
    config: WatchdogConfig,
    layout: Layout,
    state: WatchdogState,
    shutdown: Shutdown,
}

impl Watchdog {
    /// Build a watchdog, resuming persisted state when present.
    #[must_use]
    pub fn new(config: WatchdogConfig, layout: Layout, shutdown: Shutdown) -> Self {
        let state = match store::read_json::<WatchdogState>(&layout.watchdog_state_path()) {
            Ok(Some(state)) => state,
            Ok(None) => WatchdogState::default(),
            Err(err) => {
                tracing::warn!(error = %err, "watchdog_state_unreadable, starting fresh");
                WatchdogState::default()
            },
        };
        Self {
            config,
            layout,
            state,
            shutdown,
        }
    }

    /// Current persisted state.
    #[must_use]
    pub const fn state(&self) -> &WatchdogState {
        &self.state
    }

    /// Run the supervisory loop until shutdown.
    ///
    /// # Errors
    ///
    /// Returns `WatchdogError` when state persistence fails.
    pub fn run(&mut self) -> Result<(), WatchdogError> {
        tracing::info!(
            interval_seconds = self.config.check_interval.as_secs(),
            "watchdog_started"
        );
        loop {
            let report = self.tick(Utc::now())?;
            if !report.failed_checks.is_empty() {
                tracing::warn!(failed = ?report.failed_checks, "watchdog_checks_failed");
            }
            if !self.shutdown.sleep(self.config.check_interval) {
                tracing::info!("watchdog_stopped");
                return Ok(());
            }
        }
    }

    /// Run one supervisory tick at `now`.
    ///
    /// # Errors
    ///
    /// Returns `WatchdogError` when state persistence fails.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport, WatchdogError> {
        let results = vec![
            self.check_heartbeat(),
            self.check_snapshot_age(),
            self.check_log_growth(now),
            self.check_locks(),
        ];

        let failed: Vec<(String, String)> = results
            .iter()
            .filter(|result| !result.ok)
            .map(|result| (result.name.to_string(), result.reason.clone()))
            .collect();

        self.record_failures(&results, now);

        let (should_act, reasons) = self.should_act(now);
        let mut restarted = false;
        let mut escalated = false;
        if should_act {
            (restarted, escalated) = self.act(&reasons, now);
        }

        store::write_json_atomic(&self.layout.watchdog_state_path(), &self.state)?;
        Ok(TickReport {
            failed_checks: failed,
            restarted,
            escalated,
        })
    }

    fn check_heartbeat(&self) -> CheckResult {
        match store::read_heartbeat(&self.layout.heartbeat_path()) {
            Ok(Some(heartbeat)) => {
                let age = Utc::now()
                    .signed_duration_since(heartbeat.written_at_utc)
                    .to_std()
                    .unwrap_or_default();
                if age > self.config.heartbeat_timeout {
                    CheckResult::failed(
                        "heartbeat",
                        format!("heartbeat_stale age_seconds={}", age.as_secs()),
                    )
                } else {
                    CheckResult::ok("heartbeat", "heartbeat_ok")
                }
            },
            Ok(None) => CheckResult::failed("heartbeat", "heartbeat_missing"),
            Err(err) => CheckResult::failed("heartbeat", format!("heartbeat_unreadable:{err}")),
        }
    }

    fn check_snapshot_age(&self) -> CheckResult {
        let snapshots = SnapshotStore::new(self.layout.snapshots_dir());
        match snapshots.newest_age_any() {
            Some(age) if age > self.config.max_inactivity => CheckResult::failed(
                "snapshot",
                format!("snapshot_stale age_seconds={}", age.as_secs()),
            ),
            Some(_) => CheckResult::ok("snapshot", "snapshot_ok"),
            None => CheckResult::failed("snapshot", "snapshot_missing"),
        }
    }

    fn check_log_growth(&mut self, now: DateTime<Utc>) -> CheckResult {
        let Some(log_path) = &self.config.log_path else {
            return CheckResult::ok("log", "log_unmonitored");
        };
        let Ok(metadata) = std::fs::metadata(log_path) else {
            return CheckResult::failed("log", "log_missing");
        };

        let size = metadata.len();
        if size > self.config.max_log_size_bytes {
            return CheckResult::failed("log", format!("log_too_large size_bytes={size}"));
        }

        let previous = self.state.log_sample.replace(LogSample {
            size_bytes: size,
            sampled_at: now,
        });
        if let Some(previous) = previous {
            let elapsed_min = now
                .signed_duration_since(previous.sampled_at)
                .num_seconds()
                .max(1) as f64
                / 60.0;
            let growth = (size.saturating_sub(previous.size_bytes)) as f64 / elapsed_min;
            if growth > self.config.max_log_growth_bytes_per_min as f64 {
                return CheckResult::failed(
                    "log",
                    format!("log_growth_fast bytes_per_min={growth:.0}"),
                );
            }
        }
        CheckResult::ok("log", "log_ok")
    }

    fn check_locks(&self) -> CheckResult {
        let mut candidates = self.config.lock_files.clone();
        if candidates.is_empty() {
            if let Ok(entries) = std::fs::read_dir(self.layout.locks_dir()) {
                for entry in entries.filter_map(Result::ok) {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "lock") {
                        candidates.push(path);
                    }
                }
            }
        }

        let mut stuck = Vec::new();
        for path in &candidates {
            if let Some(age) = lockfile::lock_age(path) {
                if age > self.config.lock_timeout {
                    stuck.push(format!("{}:{}s", path.display(), age.as_secs()));
                }
            }
        }
        if stuck.is_empty() {
            CheckResult::ok("locks", "locks_ok")
        } else {
            CheckResult::failed("locks", format!("lock_stuck {}", stuck.join(",")))
        }
    }

    fn record_failures(&mut self, results: &[CheckResult], now: DateTime<Utc>) {
        for result in results {
            if result.ok {
                if self.state.failures.remove(result.name).is_some() {
                    tracing::info!(check = result.name, "watchdog_recovered");
                }
                continue;
            }
            self.state
                .failures
                .entry(result.name.to_string())
                .and_modify(|entry| {
                    entry.last_seen = now;
                    entry.reason = result.reason.clone();
                })
                .or_insert_with(|| FailureEntry {
                    first_seen: now,
                    last_seen: now,
                    reason: result.reason.clone(),
                });
        }
        // A fully recovered system re-arms the escalation alert.
        if self.state.failures.is_empty() {
            self.state.escalated = false;
        }
    }

    fn should_act(&self, now: DateTime<Utc>) -> (bool, Vec<String>) {
        let reasons: Vec<String> = self
            .state
            .failures
            .iter()
            .filter(|(_, entry)| {
                now.signed_duration_since(entry.first_seen)
                    .to_std()
                    .unwrap_or_default()
                    >= self.config.failure_grace
            })
            .map(|(name, entry)| format!("{name}:{}", entry.reason))
            .collect();
        if reasons.is_empty() {
            return (false, reasons);
        }

        if let Some(last_action) = self.state.last_action {
            let since = now
                .signed_duration_since(last_action)
                .to_std()
                .unwrap_or_default();
            if since < self.config.action_cooldown {
                return (false, reasons);
            }
        }
        (true, reasons)
    }

    fn restarts_in_window(&self, now: DateTime<Utc>) -> usize {
        self.state
            .restart_history
            .iter()
            .filter(|at| {
                now.signed_duration_since(**at)
                    .to_std()
                    .unwrap_or_default()
                    <= self.config.restart_window
            })
            .count()
    }

    /// Returns `(restarted, escalated)`.
    fn act(&mut self, reasons: &[String], now: DateTime<Utc>) -> (bool, bool) {
        let message = reasons.join("; ");
        self.state.last_action = Some(now);

        let within_bound = self.restarts_in_window(now) < self.config.max_attempts as usize;
        if within_bound && !self.config.restart_command.is_empty() {
            tracing::warn!(reasons = %message, "watchdog_restarting_pipeline");
            self.remove_stale_locks();
            let restarted = self.run_restart_command();
            self.state.restart_history.push(now);
            self.prune_restart_history(now);
            self.send_alerts(&format!("watchdog restart triggered: {message}"));
            (restarted, false)
        } else if self.state.escalated {
            (false, false)
        } else {
            // Attempts exhausted (or no restart command): one human-facing
            // alert per episode instead of further restarts.
            tracing::error!(reasons = %message, "watchdog_escalation");
            self.state.escalated = true;
            self.send_alerts(&format!(
                "watchdog escalation, manual intervention required: {message}"
            ));
            (false, true)
        }
    }

    fn prune_restart_history(&mut self, now: DateTime<Utc>) {
        let window = self.config.restart_window;
        self.state.restart_history.retain(|at| {
            now.signed_duration_since(*at)
                .to_std()
                .unwrap_or_default()
                <= window
        });
    }

    fn remove_stale_locks(&self) {
        let Ok(entries) = std::fs::read_dir(self.layout.locks_dir()) else {
            return;
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "lock") {
                continue;
            }
            if let Some(age) = lockfile::lock_age(&path) {
                if age > self.config.lock_timeout {
                    match std::fs::remove_file(&path) {
                        Ok(()) => {
                            tracing::warn!(path = %path.display(), "stale_lock_removed");
                        },
                        Err(err) => {
                            tracing::warn!(path = %path.display(), error = %err, "stale_lock_remove_failed");
                        },
                    }
                }
            }
        }
    }

    fn run_restart_command(&self) -> bool {
        let mut parts = self.config.restart_command.iter();
        let Some(program) = parts.next() else {
            return false;
        };
        let mut child = match std::process::Command::new(program).args(parts).spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(error = %err, "watchdog_restart_spawn_failed");
                return false;
            },
        };

        // Bounded wait; a hung restart command must not wedge the watchdog.
        let deadline = std::time::Instant::now() + self.config.restart_timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(code = ?status.code(), "watchdog_restart_finished");
                    return status.success();
                },
                Ok(None) => {
                    if std::time::Instant::now() >= deadline {
                        tracing::warn!("watchdog_restart_still_running, detaching");
                        return true;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                },
                Err(err) => {
                    tracing::error!(error = %err, "watchdog_restart_wait_failed");
                    return false;
                },
            }
        }
    }

    fn send_alerts(&self, message: &str) {
        for url in &self.config.alert_urls {
            let client = match reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
            {
                Ok(client) => client,
                Err(err) => {
                    tracing::warn!(error = %err, "watchdog_alert_client_failed");
                    return;
                },
            };
            let payload = json!({ "event": "watchdog_alert", "message": message });
            match client.post(url).json(&payload).send() {
                Ok(response) => {
                    tracing::info!(url = %url, status = response.status().as_u16(), "watchdog_alert_sent");
                },
                Err(err) => {
                    tracing::warn!(url = %url, error = %err, "watchdog_alert_failed");
                },
            }
        }
    }
}
