//! Acquisition cycle orchestration.
//!
//! One cycle runs end-to-end: idempotency window check, circuit breaker
//! gate, identity selection, a single HTTP GET under a hard timeout,
//! outcome classification, retry-policy decision, and on success the
//! evidence-chain append plus snapshot persistence. Terminal failures
//! append a durable failure record and increment the breaker's failure
//! counter instead of crashing the process.
//!
//! The loop is single-flight: exactly one outbound call is in progress at
//! a time, enforced by the cycle lock. Backoff sleeps are cancellable
//! through the shared [`Shutdown`] signal, and the heartbeat file is
//! rewritten atomically after every completed cycle for the watchdog.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use thiserror::Error;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::evidence::chain::{ChainError, EvidenceChain, HashRecord};
use crate::evidence::sign::RecordSigner;
use crate::identity::{self, Identity, IdentityPoolConfig, IdentityRotator};
use crate::lockfile::{self, LockError};
use crate::mode::{self, CycleMetrics, ModeThresholds, OperatingMode};
use crate::retry::{Decision, GiveUpReason, Outcome, RetryConfig, TransportKind};
use crate::shutdown::Shutdown;
use crate::store::{
    self, FailureLog, FailureRecord, Heartbeat, Layout, Snapshot, SnapshotStore, StoreError,
};

/// One acquisition target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// Stable source identifier; keys the idempotency window and the
    /// snapshot subdirectory.
    pub id: String,

    /// URL fetched each cycle.
    pub url: String,
}

/// Receives operator-facing alerts.
///
/// The orchestrator emits through this seam so callers can fan alerts out
/// to webhooks or pagers; the default sink writes a structured warning.
pub trait AlertSink {
    /// Deliver one alert event.
    fn alert(&self, event: &str, payload: &serde_json::Value);
}

/// Default sink: alerts become structured log warnings.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, event: &str, payload: &serde_json::Value) {
        tracing::warn!(event, payload = %payload, "alert");
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Payload captured, snapshot persisted, chain appended.
    Captured,

    /// A recent snapshot exists inside the idempotency window.
    SkippedRecent,

    /// The circuit breaker denied the cycle.
    BreakerOpen,

    /// Retries exhausted or policy gave up; failure record appended.
    Failed,

    /// Shutdown was requested mid-cycle.
    Aborted,
}

impl CycleOutcome {
    /// Lowercase label for logs and the heartbeat file.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Captured => "captured",
            Self::SkippedRecent => "skipped_recent",
            Self::BreakerOpen => "breaker_open",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

/// Result of one cycle.
#[derive(Debug)]
pub struct CycleReport {
    /// How the cycle ended.
    pub outcome: CycleOutcome,

    /// Attempts made (0 when no call was attempted).
    pub attempts: u32,

    /// Operating mode after the cycle.
    pub mode: OperatingMode,

    /// Recommended delay before the next cycle, scaled by the mode.
    pub recommended_delay: Duration,

    /// The appended record, when the cycle captured.
    pub record: Option<HashRecord>,
}

/// Operational errors that prevent a cycle from running at all.
///
/// Fetch failures are not errors; they resolve into
/// [`CycleOutcome::Failed`] reports.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Another cycle holds the single-flight lock.
    #[error("another acquisition cycle is already in flight")]
    CycleInProgress,

    /// Lock infrastructure failure.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Evidence chain failure.
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Classified failure of one attempt.
#[derive(Debug)]
struct AttemptFailure {
    outcome: Outcome,
    error: String,
    status_code: Option<u16>,
    response_text: Option<String>,
}

/// Truncate `text` to at most `limit` bytes on a char boundary, appending
/// an ellipsis when cut.
fn truncate_payload(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Runs acquisition cycles end-to-end.
pub struct FetchOrchestrator {
    layout: Layout,
    retry: RetryConfig,
    breaker: CircuitBreaker,
    rotator: IdentityRotator,
    chain: EvidenceChain,
    snapshots: SnapshotStore,
    failures: FailureLog,
    shutdown: Shutdown,
    signer: Option<RecordSigner>,
    alert: Box<dyn AlertSink>,
    mode_thresholds: ModeThresholds,
    metrics: CycleMetrics,
    mode: OperatingMode,
    software_version: String,
    identities_validated: bool,
}

impl FetchOrchestrator {
    /// Build an orchestrator over the shared on-disk layout.
    ///
    /// The circuit breaker resumes from its checkpoint when one exists.
    #[must_use]
    pub fn new(
        layout: Layout,
        retry: RetryConfig,
        breaker_config: BreakerConfig,
        pool: &IdentityPoolConfig,
        shutdown: Shutdown,
    ) -> Self {
        let breaker = CircuitBreaker::load_or_default(breaker_config, &layout.breaker_state_path());
        let failures_path: PathBuf = retry
            .failed_requests_path
            .clone()
            .unwrap_or_else(|| layout.failed_requests_path());
        let chain = EvidenceChain::new(layout.ledger_dir(), layout.ledger_lock_path());
        let snapshots = SnapshotStore::new(layout.snapshots_dir());

        Self {
            layout,
            retry,
            breaker,
            rotator: IdentityRotator::new(pool),
            chain,
            snapshots,
            failures: FailureLog::new(failures_path),
            shutdown,
            signer: None,
            alert: Box::new(LogAlertSink),
            mode_thresholds: ModeThresholds::default(),
            metrics: CycleMetrics::default(),
            mode: OperatingMode::Normal,
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            identities_validated: false,
        }
    }

    /// Sign appended records with `signer`.
    #[must_use]
    pub fn with_signer(mut self, signer: RecordSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Replace the alert sink.
    #[must_use]
    pub fn with_alert_sink(mut self, alert: Box<dyn AlertSink>) -> Self {
        self.alert = alert;
        self
    }

    /// Override the mode transition thresholds.
    #[must_use]
    pub fn with_mode_thresholds(mut self, thresholds: ModeThresholds) -> Self {
        self.mode_thresholds = thresholds;
        self
    }

    /// Current operating mode.
    #[must_use]
    pub const fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Run one acquisition cycle for `source`.
    ///
    /// # Errors
    ///
    /// Returns `FetchError` for operational problems (lock contention,
    /// persistence failures). Fetch failures resolve into the report.
    pub fn run_cycle(&mut self, source: &SourceConfig) -> Result<CycleReport, FetchError> {
        let _cycle_guard = lockfile::try_lock(&self.layout.cycle_lock_path())?
            .ok_or(FetchError::CycleInProgress)?;

        // Idempotency window: a repeat capture inside the window is a
        // no-op, not a new snapshot.
        if self.retry.recent_snapshot_seconds > 0 {
            if let Some(age) = self.snapshots.newest_age(&source.id) {
                if age.as_secs() <= self.retry.recent_snapshot_seconds {
                    tracing::info!(
                        source = %source.id,
                        age_seconds = age.as_secs(),
                        "cycle_skipped_recent_snapshot"
                    );
                    return Ok(self.complete(CycleOutcome::SkippedRecent, 0, None, None));
                }
            }
        }

        let now = Utc::now();
        if !self.breaker.allow_request(now) {
            if self.breaker.should_log_open_wait(now) {
                tracing::warn!(
                    state = %self.breaker.state(),
                    wait_seconds = self.breaker.seconds_until_half_open(now),
                    "breaker_open_waiting"
                );
            }
            self.save_breaker();
            return Ok(self.complete(CycleOutcome::BreakerOpen, 0, None, None));
        }

        if !self.identities_validated {
            self.identities_validated = true;
            match self.rotator.validate_pool() {
                Ok(active) => {
                    tracing::info!(active, "identity_pool_validated");
                },
                Err(err) => {
                    tracing::warn!(error = %err, "identity_pool_validation_error");
                },
            }
            self.drain_identity_alerts(source);
        }

        self.attempt_loop(source)
    }

    fn attempt_loop(&mut self, source: &SourceConfig) -> Result<CycleReport, FetchError> {
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown.is_requested() {
                return self.abort(source, attempt, "shutdown_requested");
            }

            let identity = self.rotator.next_identity();
            tracing::info!(
                attempt = attempt + 1,
                url = %source.url,
                identity = %identity.name,
                "request_attempt"
            );

            let started = Instant::now();
            let result = self.attempt_fetch(source, &identity);
            let elapsed = started.elapsed();

            match result {
                Ok(payload) => {
                    return self.capture(source, &identity, payload, attempt + 1, elapsed);
                },
                Err(failure) => {
                    self.rotator.mark_failure(&identity.name, &failure.error);
                    if matches!(failure.outcome, Outcome::Status(403 | 429)) {
                        self.rotator.force_rotation();
                    }
                    self.drain_identity_alerts(source);

                    match self.retry.decide(&failure.outcome, attempt) {
                        Decision::RetryAfter(delay) => {
                            tracing::warn!(
                                attempt = attempt + 1,
                                wait_seconds = delay.as_secs_f64(),
                                error = %failure.error,
                                "retry_sleep"
                            );
                            if !self.shutdown.sleep(delay) {
                                return self.abort(source, attempt + 1, "shutdown_requested");
                            }
                            attempt += 1;
                        },
                        Decision::GiveUp(reason) => {
                            return self.give_up(source, &failure, attempt + 1, reason, elapsed);
                        },
                    }
                },
            }
        }
    }

    fn attempt_fetch(
        &self,
        source: &SourceConfig,
        identity: &Identity,
    ) -> Result<String, AttemptFailure> {
        let limit = self.retry.log_payload_bytes;
        let client =
            identity::build_client(identity, self.retry.timeout()).map_err(|err| {
                AttemptFailure {
                    outcome: Outcome::Transport(TransportKind::Other),
                    error: format!("client_build_failed: {err}"),
                    status_code: None,
                    response_text: None,
                }
            })?;

        let response = client
            .get(&source.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .map_err(|err| {
                let kind = if err.is_timeout() {
                    TransportKind::Timeout
                } else if err.is_connect() {
                    TransportKind::Connect
                } else {
                    TransportKind::Other
                };
                AttemptFailure {
                    outcome: Outcome::Transport(kind),
                    error: format!("transport_error[{}]: {err}", kind.as_str()),
                    status_code: None,
                    response_text: None,
                }
            })?;

        let status = response.status();
        let text = response.text().map_err(|err| AttemptFailure {
            outcome: Outcome::Transport(TransportKind::Other),
            error: format!("body_read_failed: {err}"),
            status_code: Some(status.as_u16()),
            response_text: None,
        })?;

        if !status.is_success() {
            return Err(AttemptFailure {
                outcome: Outcome::Status(status.as_u16()),
                error: format!("retryable_status={}", status.as_u16()),
                status_code: Some(status.as_u16()),
                response_text: Some(truncate_payload(&text, limit)),
            });
        }

        // Payload must be well-formed JSON before it becomes evidence.
        if let Err(err) = serde_json::from_str::<serde_json::Value>(&text) {
            return Err(AttemptFailure {
                outcome: Outcome::Parse,
                error: format!("json_parse_error: {err}"),
                status_code: Some(status.as_u16()),
                response_text: Some(truncate_payload(&text, limit)),
            });
        }

        Ok(text)
    }

    fn capture(
        &mut self,
        source: &SourceConfig,
        identity: &Identity,
        payload: String,
        attempts: u32,
        elapsed: Duration,
    ) -> Result<CycleReport, FetchError> {
        let now = Utc::now();
        self.rotator.mark_success(&identity.name);
        if self.breaker.record_success(now) {
            tracing::info!("breaker_closed");
        }
        self.save_breaker();

        let snapshot = Snapshot {
            source_id: source.id.clone(),
            source_url: source.url.clone(),
            captured_at_utc: now,
            software_version: self.software_version.clone(),
            payload,
        };
        let path = self.snapshots.persist(&snapshot)?;
        let relative = path
            .strip_prefix(self.layout.root())
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        let record = self.chain.append(&snapshot, &relative, self.signer.as_ref())?;

        tracing::info!(
            source = %source.id,
            sequence_index = record.sequence_index,
            elapsed_seconds = elapsed.as_secs_f64(),
            attempts,
            "cycle_captured"
        );
        Ok(self.complete(CycleOutcome::Captured, attempts, Some(record), Some((true, elapsed))))
    }

    fn give_up(
        &mut self,
        source: &SourceConfig,
        failure: &AttemptFailure,
        attempts: u32,
        reason: GiveUpReason,
        elapsed: Duration,
    ) -> Result<CycleReport, FetchError> {
        let now = Utc::now();

        if reason == GiveUpReason::AlertOnly {
            self.alert.alert(
                "retry_alert",
                &json!({
                    "status_code": failure.status_code,
                    "url": source.url,
                    "source": source.id,
                }),
            );
        }

        tracing::error!(
            url = %source.url,
            attempts,
            error = %failure.error,
            "request_failed"
        );
        self.append_failure_record(source, failure, attempts, now);

        if self.breaker.record_failure(now) && self.breaker.consume_open_alert() {
            self.alert.alert(
                "breaker_open",
                &json!({
                    "source": source.id,
                    "failure_count": self.breaker.failure_count(),
                }),
            );
        }
        self.save_breaker();

        Ok(self.complete(CycleOutcome::Failed, attempts, None, Some((false, elapsed))))
    }

    fn abort(
        &mut self,
        source: &SourceConfig,
        attempts: u32,
        reason: &str,
    ) -> Result<CycleReport, FetchError> {
        // Flush a durable record for the interrupted sequence before exit.
        if attempts > 0 {
            let failure = AttemptFailure {
                outcome: Outcome::Transport(TransportKind::Other),
                error: reason.to_string(),
                status_code: None,
                response_text: None,
            };
            self.append_failure_record(source, &failure, attempts, Utc::now());
        }
        tracing::info!(attempts, reason, "cycle_aborted");
        Ok(self.complete(CycleOutcome::Aborted, attempts, None, None))
    }

    fn append_failure_record(
        &self,
        source: &SourceConfig,
        failure: &AttemptFailure,
        attempts: u32,
        now: chrono::DateTime<Utc>,
    ) {
        let record = FailureRecord {
            timestamp: now,
            url: source.url.clone(),
            method: "GET".to_string(),
            attempts,
            status_code: failure.status_code,
            error: failure.error.clone(),
            response_text: failure.response_text.clone(),
        };
        // Best-effort: losing one failure record must not kill the cycle.
        if let Err(err) = self.failures.append(&record) {
            tracing::warn!(error = %err, "failed_requests_write_failed");
        }
    }

    fn drain_identity_alerts(&mut self, source: &SourceConfig) {
        if self.rotator.consume_fallback_alert() {
            self.alert.alert(
                "identity_fallback_direct",
                &json!({ "source": source.id }),
            );
        }
    }

    fn save_breaker(&self) {
        if let Err(err) = self.breaker.save(&self.layout.breaker_state_path()) {
            tracing::warn!(error = %err, "breaker_checkpoint_write_failed");
        }
    }

    fn complete(
        &mut self,
        outcome: CycleOutcome,
        attempts: u32,
        record: Option<HashRecord>,
        measured: Option<(bool, Duration)>,
    ) -> CycleReport {
        if let Some((success, latency)) = measured {
            self.metrics.record(success, latency);
        }
        self.mode = mode::transition(&self.mode_thresholds, &self.metrics);

        let heartbeat = Heartbeat {
            written_at_utc: Utc::now(),
            pid: std::process::id(),
            last_outcome: outcome.as_str().to_string(),
            mode: self.mode.as_str().to_string(),
        };
        if let Err(err) = store::write_heartbeat(&self.layout.heartbeat_path(), &heartbeat) {
            tracing::warn!(error = %err, "heartbeat_write_failed");
        }

        CycleReport {
            outcome,
            attempts,
            mode: self.mode,
            recommended_delay: mode::recommended_delay(&self.mode_thresholds, self.mode),
            record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_caps_bytes_and_marks_cut() {
        assert_eq!(truncate_payload("short", 100), "short");
        let cut = truncate_payload(&"x".repeat(50), 10);
        assert_eq!(cut, format!("{}...", "x".repeat(10)));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // "é" is two bytes; a 3-byte limit falls inside the second "é".
        let cut = truncate_payload("ééé", 3);
        assert_eq!(cut, "é...");
    }

    #[test]
    fn cycle_outcome_labels_are_stable() {
        assert_eq!(CycleOutcome::Captured.as_str(), "captured");
        assert_eq!(CycleOutcome::SkippedRecent.as_str(), "skipped_recent");
        assert_eq!(CycleOutcome::BreakerOpen.as_str(), "breaker_open");
    }
}
