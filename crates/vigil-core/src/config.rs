//! Configuration loading helpers.
//!
//! Each subsystem owns its configuration struct (see [`crate::retry`],
//! [`crate::breaker`], [`crate::identity`], [`crate::watchdog`]); this module
//! provides the shared TOML loading path and the error type. Documents are
//! loaded into strongly-typed structs with `deny_unknown_fields` so malformed
//! or unknown keys are rejected at startup instead of silently defaulting.

use std::path::Path;

use serde::de::DeserializeOwned;

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading a configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Load a typed configuration document from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed. Unknown fields
/// fail parsing for document types declaring `deny_unknown_fields`.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
    parse_toml(&content)
}

/// Parse a typed configuration document from a TOML string.
///
/// # Errors
///
/// Returns an error if the TOML is invalid for the target type.
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T, ConfigError> {
    toml::from_str(content).map_err(ConfigError::Parse)
}

/// Serde adapter for humantime-formatted durations ("90s", "15m", "2h").
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Sample {
        #[serde(with = "humantime_serde")]
        interval: Duration,
    }

    #[test]
    fn parses_humantime_durations() {
        let sample: Sample = parse_toml("interval = \"15m\"").unwrap();
        assert_eq!(sample.interval, Duration::from_secs(900));
    }

    #[test]
    fn rejects_unknown_fields() {
        let result: Result<Sample, _> = parse_toml("interval = \"1s\"\nbogus = 1");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
