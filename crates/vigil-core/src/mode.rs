//! Operating mode for the acquisition loop.
//!
//! The mode is an explicit value threaded through the orchestrator's cycle
//! context and derived by a pure transition function over recent
//! failure/latency metrics. It scales the recommended delay between cycles;
//! nothing here is process-global.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many recent cycles feed the success/latency windows.
const METRICS_WINDOW: usize = 20;

/// Acquisition loop operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Healthy; baseline pacing.
    Normal,

    /// Degraded; slow down before the source blocks us.
    Conservative,

    /// Chain invalid or failures sustained; investigate before continuing.
    Critical,
}

impl OperatingMode {
    /// Lowercase label for logs and the heartbeat file.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Conservative => "conservative",
            Self::Critical => "critical",
        }
    }
}

impl Default for OperatingMode {
    fn default() -> Self {
        Self::Normal
    }
}

/// Thresholds driving mode transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModeThresholds {
    /// Consecutive failures that force Conservative.
    #[serde(default = "default_failures_conservative")]
    pub consecutive_failures_conservative: u32,

    /// Consecutive failures that force Critical.
    #[serde(default = "default_failures_critical")]
    pub consecutive_failures_critical: u32,

    /// Success rate below which the loop turns Conservative.
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,

    /// Average latency above which the loop turns Conservative, in seconds.
    #[serde(default = "default_max_avg_latency_seconds")]
    pub max_avg_latency_seconds: f64,

    /// Baseline inter-cycle delay, in seconds.
    #[serde(default = "default_baseline_interval_seconds")]
    pub baseline_interval_seconds: u64,

    /// Minimum Conservative delay, in seconds.
    #[serde(default = "default_conservative_floor_seconds")]
    pub conservative_floor_seconds: u64,

    /// Minimum Critical delay, in seconds.
    #[serde(default = "default_critical_floor_seconds")]
    pub critical_floor_seconds: u64,
}

const fn default_failures_conservative() -> u32 {
    2
}

const fn default_failures_critical() -> u32 {
    5
}

const fn default_min_success_rate() -> f64 {
    0.70
}

const fn default_max_avg_latency_seconds() -> f64 {
    10.0
}

const fn default_baseline_interval_seconds() -> u64 {
    300
}

const fn default_conservative_floor_seconds() -> u64 {
    900
}

const fn default_critical_floor_seconds() -> u64 {
    1800
}

impl Default for ModeThresholds {
    fn default() -> Self {
        Self {
            consecutive_failures_conservative: default_failures_conservative(),
            consecutive_failures_critical: default_failures_critical(),
            min_success_rate: default_min_success_rate(),
            max_avg_latency_seconds: default_max_avg_latency_seconds(),
            baseline_interval_seconds: default_baseline_interval_seconds(),
            conservative_floor_seconds: default_conservative_floor_seconds(),
            critical_floor_seconds: default_critical_floor_seconds(),
        }
    }
}

/// Rolling metrics from recent acquisition cycles.
#[derive(Debug, Clone)]
pub struct CycleMetrics {
    /// Current run of failed cycles.
    pub consecutive_failures: u32,

    /// Recent cycle outcomes, newest last, bounded window.
    pub success_history: Vec<bool>,

    /// Recent cycle latencies in seconds, bounded window.
    pub latency_history: Vec<f64>,

    /// Whether the evidence chain verified on last check.
    pub chain_valid: bool,
}

impl Default for CycleMetrics {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            success_history: Vec::new(),
            latency_history: Vec::new(),
            chain_valid: true,
        }
    }
}

impl CycleMetrics {
    /// Record one finished cycle.
    pub fn record(&mut self, success: bool, latency: Duration) {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        self.success_history.push(success);
        self.latency_history.push(latency.as_secs_f64());
        if self.success_history.len() > METRICS_WINDOW {
            self.success_history.remove(0);
        }
        if self.latency_history.len() > METRICS_WINDOW {
            self.latency_history.remove(0);
        }
    }

    /// Success ratio over the window; 1.0 when empty.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.success_history.is_empty() {
            return 1.0;
        }
        let successes = self.success_history.iter().filter(|s| **s).count();
        successes as f64 / self.success_history.len() as f64
    }

    /// Mean latency over the window; 0.0 when empty.
    #[must_use]
    pub fn avg_latency_seconds(&self) -> f64 {
        if self.latency_history.is_empty() {
            return 0.0;
        }
        self.latency_history.iter().sum::<f64>() / self.latency_history.len() as f64
    }
}

/// Pure mode transition over the current metrics.
#[must_use]
pub fn transition(thresholds: &ModeThresholds, metrics: &CycleMetrics) -> OperatingMode {
    if !metrics.chain_valid
        || metrics.consecutive_failures >= thresholds.consecutive_failures_critical
    {
        return OperatingMode::Critical;
    }
    if metrics.consecutive_failures >= thresholds.consecutive_failures_conservative
        || metrics.success_rate() < thresholds.min_success_rate
        || metrics.avg_latency_seconds() > thresholds.max_avg_latency_seconds
    {
        return OperatingMode::Conservative;
    }
    OperatingMode::Normal
}

/// Recommended inter-cycle delay for a mode.
#[must_use]
pub fn recommended_delay(thresholds: &ModeThresholds, mode: OperatingMode) -> Duration {
    let baseline = thresholds.baseline_interval_seconds;
    let seconds = match mode {
        OperatingMode::Normal => baseline,
        OperatingMode::Conservative => thresholds.conservative_floor_seconds.max(baseline * 3),
        OperatingMode::Critical => thresholds.critical_floor_seconds.max(baseline * 6),
    };
    Duration::from_secs(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_metrics_stay_normal() {
        let thresholds = ModeThresholds::default();
        let mut metrics = CycleMetrics::default();
        for _ in 0..5 {
            metrics.record(true, Duration::from_secs(1));
        }
        assert_eq!(transition(&thresholds, &metrics), OperatingMode::Normal);
    }

    #[test]
    fn two_consecutive_failures_turn_conservative() {
        let thresholds = ModeThresholds::default();
        let mut metrics = CycleMetrics::default();
        for _ in 0..8 {
            metrics.record(true, Duration::from_secs(1));
        }
        metrics.record(false, Duration::from_secs(1));
        metrics.record(false, Duration::from_secs(1));
        assert_eq!(
            transition(&thresholds, &metrics),
            OperatingMode::Conservative
        );
    }

    #[test]
    fn five_consecutive_failures_turn_critical() {
        let thresholds = ModeThresholds::default();
        let mut metrics = CycleMetrics::default();
        for _ in 0..5 {
            metrics.record(false, Duration::from_secs(1));
        }
        assert_eq!(transition(&thresholds, &metrics), OperatingMode::Critical);
    }

    #[test]
    fn broken_chain_is_always_critical() {
        let thresholds = ModeThresholds::default();
        let mut metrics = CycleMetrics::default();
        metrics.record(true, Duration::from_secs(1));
        metrics.chain_valid = false;
        assert_eq!(transition(&thresholds, &metrics), OperatingMode::Critical);
    }

    #[test]
    fn slow_source_turns_conservative() {
        let thresholds = ModeThresholds::default();
        let mut metrics = CycleMetrics::default();
        for _ in 0..5 {
            metrics.record(true, Duration::from_secs(30));
        }
        assert_eq!(
            transition(&thresholds, &metrics),
            OperatingMode::Conservative
        );
    }

    #[test]
    fn recommended_delay_scales_with_mode() {
        let thresholds = ModeThresholds::default();
        assert_eq!(
            recommended_delay(&thresholds, OperatingMode::Normal),
            Duration::from_secs(300)
        );
        assert_eq!(
            recommended_delay(&thresholds, OperatingMode::Conservative),
            Duration::from_secs(900)
        );
        assert_eq!(
            recommended_delay(&thresholds, OperatingMode::Critical),
            Duration::from_secs(1800)
        );
    }

    #[test]
    fn history_window_is_bounded() {
        let mut metrics = CycleMetrics::default();
        for _ in 0..50 {
            metrics.record(true, Duration::from_secs(1));
        }
        assert_eq!(metrics.success_history.len(), METRICS_WINDOW);
        assert_eq!(metrics.latency_history.len(), METRICS_WINDOW);
    }
}
