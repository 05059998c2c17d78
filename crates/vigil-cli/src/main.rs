//! vigil - resilient acquisition and evidence-trail CLI
//!
//! Thin clap wrapper over `vigil-core`: run one acquisition cycle, verify
//! the evidence chain, assemble and verify evidence bundles, and run the
//! watchdog loop.
//!
//! Exit codes: 0 PASS, 1 FAIL, 2 usage error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

/// Exit code for verification failures.
pub(crate) const EXIT_FAIL: u8 = 1;

/// Exit code for usage errors.
pub(crate) const EXIT_USAGE: u8 = 2;

/// vigil - resilient acquisition and evidence-trail engine
#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data root directory (snapshots, ledger, heartbeat, locks)
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one acquisition cycle
    Cycle {
        /// Source URL to fetch
        #[arg(long)]
        url: String,

        /// Stable source identifier
        #[arg(long)]
        source: String,

        /// Retry policy configuration (TOML)
        #[arg(long)]
        retry_config: Option<PathBuf>,

        /// Circuit breaker configuration (TOML)
        #[arg(long)]
        breaker_config: Option<PathBuf>,

        /// Identity pool configuration (TOML)
        #[arg(long)]
        identity_config: Option<PathBuf>,

        /// Sign appended records with the key at this path (created when
        /// absent)
        #[arg(long)]
        sign_key: Option<PathBuf>,
    },

    /// Verify the evidence chain by replaying it
    VerifyChain {
        /// Resume from a trusted checkpoint, formatted INDEX:HASH
        #[arg(long)]
        from_checkpoint: Option<String>,
    },

    /// Assemble an evidence bundle over a finalized directory
    Bundle {
        /// Directory to index
        #[arg(long)]
        input_dir: PathBuf,

        /// Output bundle JSON path
        #[arg(long)]
        output: PathBuf,
    },

    /// Verify an evidence bundle against its base directory
    VerifyBundle {
        /// Bundle JSON path
        #[arg(long)]
        bundle: PathBuf,

        /// Base directory the manifest paths resolve against
        #[arg(long)]
        base_dir: PathBuf,
    },

    /// Run the watchdog supervisory loop
    Watchdog {
        /// Watchdog configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FAIL)
        },
    }
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    match cli.command {
        Commands::Cycle {
            url,
            source,
            retry_config,
            breaker_config,
            identity_config,
            sign_key,
        } => commands::cycle::run(commands::cycle::CycleArgs {
            data_dir: cli.data_dir,
            url,
            source,
            retry_config,
            breaker_config,
            identity_config,
            sign_key,
        }),
        Commands::VerifyChain { from_checkpoint } => {
            commands::verify::run_chain(&cli.data_dir, from_checkpoint.as_deref())
        },
        Commands::Bundle { input_dir, output } => commands::bundle::run(&input_dir, &output),
        Commands::VerifyBundle { bundle, base_dir } => {
            commands::verify::run_bundle(&bundle, &base_dir)
        },
        Commands::Watchdog { config } => commands::watchdog::run(&cli.data_dir, config.as_deref()),
    }
}
