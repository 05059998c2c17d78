//! `vigil watchdog` - run the supervisory loop.

use std::path::Path;

use anyhow::Context;
use vigil_core::config;
use vigil_core::shutdown::Shutdown;
use vigil_core::store::Layout;
use vigil_core::watchdog::{Watchdog, WatchdogConfig};

/// Run the watchdog loop until the process is terminated.
pub fn run(data_dir: &Path, config_path: Option<&Path>) -> anyhow::Result<u8> {
    let config: WatchdogConfig = match config_path {
        Some(path) => config::load_toml(path)
            .with_context(|| format!("loading watchdog config from {}", path.display()))?,
        None => WatchdogConfig::default(),
    };

    let layout = Layout::new(data_dir);
    let mut watchdog = Watchdog::new(config, layout, Shutdown::new());
    watchdog.run().context("watchdog loop failed")?;
    Ok(0)
}
