//! `vigil cycle` - run one acquisition cycle.

use std::path::PathBuf;

use anyhow::Context;
use vigil_core::breaker::BreakerConfig;
use vigil_core::config;
use vigil_core::evidence::sign::RecordSigner;
use vigil_core::fetch::{CycleOutcome, FetchOrchestrator, SourceConfig};
use vigil_core::identity::IdentityPoolConfig;
use vigil_core::retry::RetryConfig;
use vigil_core::shutdown::Shutdown;
use vigil_core::store::Layout;

use crate::EXIT_FAIL;

/// Arguments for one cycle run.
pub struct CycleArgs {
    pub data_dir: PathBuf,
    pub url: String,
    pub source: String,
    pub retry_config: Option<PathBuf>,
    pub breaker_config: Option<PathBuf>,
    pub identity_config: Option<PathBuf>,
    pub sign_key: Option<PathBuf>,
}

/// Run one acquisition cycle and report the outcome.
pub fn run(args: CycleArgs) -> anyhow::Result<u8> {
    let retry: RetryConfig = match args.retry_config.as_deref() {
        Some(path) => config::load_toml(path)
            .with_context(|| format!("loading retry config from {}", path.display()))?,
        None => RetryConfig::default(),
    };
    let breaker: BreakerConfig = match args.breaker_config.as_deref() {
        Some(path) => config::load_toml(path)
            .with_context(|| format!("loading breaker config from {}", path.display()))?,
        None => BreakerConfig::default(),
    };
    let pool: IdentityPoolConfig = match args.identity_config.as_deref() {
        Some(path) => config::load_toml(path)
            .with_context(|| format!("loading identity config from {}", path.display()))?,
        None => IdentityPoolConfig::default(),
    };
    pool.validate().context("identity pool config invalid")?;

    let layout = Layout::new(&args.data_dir);
    let mut orchestrator =
        FetchOrchestrator::new(layout, retry, breaker, &pool, Shutdown::new());

    if let Some(key_path) = &args.sign_key {
        let signer = RecordSigner::load_or_generate(key_path)
            .with_context(|| format!("loading signing key from {}", key_path.display()))?;
        orchestrator = orchestrator.with_signer(signer);
    }

    let source = SourceConfig {
        id: args.source,
        url: args.url,
    };
    let report = orchestrator.run_cycle(&source)?;

    println!("cycle_outcome={}", report.outcome.as_str());
    println!("attempts={}", report.attempts);
    println!("mode={}", report.mode.as_str());
    println!(
        "recommended_delay_seconds={}",
        report.recommended_delay.as_secs()
    );
    if let Some(record) = &report.record {
        println!("sequence_index={}", record.sequence_index);
        println!("chain_hash={}", record.chain_hash);
    }

    Ok(match report.outcome {
        CycleOutcome::Captured | CycleOutcome::SkippedRecent => 0,
        CycleOutcome::BreakerOpen | CycleOutcome::Failed | CycleOutcome::Aborted => EXIT_FAIL,
    })
}
