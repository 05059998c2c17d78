//! End-to-end acquisition cycle tests against a local HTTP stub.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread::JoinHandle;

use vigil_core::breaker::BreakerConfig;
use vigil_core::evidence::bundle::{self, BundleVerdict};
use vigil_core::evidence::chain::{ChainVerdict, EvidenceChain};
use vigil_core::fetch::{CycleOutcome, FetchOrchestrator, SourceConfig};
use vigil_core::identity::IdentityPoolConfig;
use vigil_core::retry::{Jitter, RetryConfig, RetryPolicy};
use vigil_core::shutdown::Shutdown;
use vigil_core::store::{self, Layout};

/// Serve one canned response per accepted connection, then exit.
fn spawn_stub(responses: Vec<(u16, String)>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
    let addr = listener.local_addr().expect("stub addr");

    let handle = std::thread::spawn(move || {
        for (status, body) in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request);

            let reason = match status {
                200 => "OK",
                429 => "Too Many Requests",
                500 => "Internal Server Error",
                _ => "Status",
            };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });

    (format!("http://{addr}/results"), handle)
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        default: RetryPolicy {
            max_attempts,
            backoff_base: 0.01,
            backoff_multiplier: 1.0,
            max_delay: 0.05,
            jitter: Jitter::Fraction(0.0),
            ..RetryPolicy::default()
        },
        ..RetryConfig::default()
    }
}

fn orchestrator(layout: Layout, retry: RetryConfig) -> FetchOrchestrator {
    FetchOrchestrator::new(
        layout,
        retry,
        BreakerConfig::default(),
        &IdentityPoolConfig::default(),
        Shutdown::new(),
    )
}

#[test]
fn successful_cycle_captures_and_chains_evidence() {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::new(dir.path());
    let payload = "{\"totals\":{\"total_votes\":12345}}".to_string();
    let (url, stub) = spawn_stub(vec![(200, payload.clone())]);

    let mut orchestrator = orchestrator(layout.clone(), fast_retry(3));
    let source = SourceConfig {
        id: "national".to_string(),
        url,
    };
    let report = orchestrator.run_cycle(&source).unwrap();
    stub.join().unwrap();

    assert_eq!(report.outcome, CycleOutcome::Captured);
    assert_eq!(report.attempts, 1);
    let record = report.record.expect("captured cycle appends a record");
    assert_eq!(record.sequence_index, 0);

    // The snapshot file holds the verbatim payload.
    let snapshot_path = layout.root().join(&record.snapshot_path);
    let snapshot = store::SnapshotStore::load(&snapshot_path).unwrap();
    assert_eq!(snapshot.payload, payload);

    // The chain replays clean from genesis.
    let chain = EvidenceChain::new(layout.ledger_dir(), layout.ledger_lock_path());
    let verdict = chain.verify(layout.root(), None).unwrap();
    assert_eq!(verdict, ChainVerdict::Pass { records: 1 });

    // The heartbeat reflects the completed cycle.
    let heartbeat = store::read_heartbeat(&layout.heartbeat_path())
        .unwrap()
        .expect("heartbeat written");
    assert_eq!(heartbeat.last_outcome, "captured");

    // A bundle over the snapshot store verifies end-to-end.
    let bundle_path = dir.path().join("bundle.json");
    let assembled = bundle::assemble(&layout.snapshots_dir()).unwrap();
    bundle::write(&assembled, &bundle_path).unwrap();
    assert_eq!(
        bundle::verify(&bundle_path, &layout.snapshots_dir()).unwrap(),
        BundleVerdict::Pass
    );
}

#[test]
fn rate_limited_source_exhausts_retries_and_logs_failure() {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::new(dir.path());
    let body = "slow down".to_string();
    let (url, stub) = spawn_stub(vec![(429, body.clone()), (429, body)]);

    let mut orchestrator = orchestrator(layout.clone(), fast_retry(2));
    let source = SourceConfig {
        id: "national".to_string(),
        url: url.clone(),
    };
    let report = orchestrator.run_cycle(&source).unwrap();
    stub.join().unwrap();

    assert_eq!(report.outcome, CycleOutcome::Failed);
    assert_eq!(report.attempts, 2);
    assert!(report.record.is_none());

    // Exactly one durable failure record with the final classification.
    let content = std::fs::read_to_string(layout.failed_requests_path()).unwrap();
    let lines: Vec<_> = content.lines().collect();
    assert_eq!(lines.len(), 1);
    let record: store::FailureRecord = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record.status_code, Some(429));
    assert_eq!(record.attempts, 2);
    assert_eq!(record.url, url);

    // No snapshot and no ledger record were produced.
    let chain = EvidenceChain::new(layout.ledger_dir(), layout.ledger_lock_path());
    assert!(chain.records().unwrap().is_empty());
}

#[test]
fn second_cycle_inside_idempotency_window_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::new(dir.path());
    let (url, stub) = spawn_stub(vec![(200, "{\"v\":1}".to_string())]);

    let mut retry = fast_retry(3);
    retry.recent_snapshot_seconds = 3600;

    let mut orchestrator = orchestrator(layout.clone(), retry);
    let source = SourceConfig {
        id: "national".to_string(),
        url,
    };

    let first = orchestrator.run_cycle(&source).unwrap();
    stub.join().unwrap();
    assert_eq!(first.outcome, CycleOutcome::Captured);

    // The stub is exhausted: a second network call would fail, proving the
    // skip happens before any request.
    let second = orchestrator.run_cycle(&source).unwrap();
    assert_eq!(second.outcome, CycleOutcome::SkippedRecent);

    let chain = EvidenceChain::new(layout.ledger_dir(), layout.ledger_lock_path());
    assert_eq!(chain.records().unwrap().len(), 1, "no duplicate snapshot");
}

#[test]
fn server_errors_are_retried_until_success() {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::new(dir.path());
    let (url, stub) = spawn_stub(vec![
        (500, "oops".to_string()),
        (500, "oops".to_string()),
        (200, "{\"v\":1}".to_string()),
    ]);

    let mut orchestrator = orchestrator(layout.clone(), fast_retry(5));
    let source = SourceConfig {
        id: "national".to_string(),
        url,
    };
    let report = orchestrator.run_cycle(&source).unwrap();
    stub.join().unwrap();

    assert_eq!(report.outcome, CycleOutcome::Captured);
    assert_eq!(report.attempts, 3);
}

#[test]
fn malformed_payload_is_a_parse_failure_with_truncated_body() {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::new(dir.path());
    let garbage = "<html>not json at all</html>".repeat(200);
    let (url, stub) = spawn_stub(vec![(200, garbage.clone()), (200, garbage)]);

    let mut retry = fast_retry(2);
    retry.log_payload_bytes = 64;

    let mut orchestrator = orchestrator(layout.clone(), retry);
    let source = SourceConfig {
        id: "national".to_string(),
        url,
    };
    let report = orchestrator.run_cycle(&source).unwrap();
    stub.join().unwrap();

    assert_eq!(report.outcome, CycleOutcome::Failed);

    let content = std::fs::read_to_string(layout.failed_requests_path()).unwrap();
    let record: store::FailureRecord =
        serde_json::from_str(content.lines().next().unwrap()).unwrap();
    assert!(record.error.starts_with("json_parse_error"));
    let body = record.response_text.expect("truncated body recorded");
    assert!(body.len() <= 64 + 3, "body must be truncated: {}", body.len());
}
