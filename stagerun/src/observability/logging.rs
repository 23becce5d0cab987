//! `tracing-subscriber` initialisation shared by the supervisor and the monitor.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" | "compact" => Ok(Self::Pretty),
            "json" | "jsonl" => Ok(Self::Json),
            other => Err(ConfigError::invalid_value(
                "log_format",
                format!("unknown log format '{other}'"),
            )),
        }
    }
}

/// Builds the filter from `RUST_LOG` if set, else from `default_level`.
pub fn build_env_filter(default_level: &str) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_level)
        .map_err(|e| ConfigError::invalid_value("log_level", format!("'{default_level}': {e}")))
}

/// Installs the global subscriber.
///
/// Returns false if a subscriber was already installed, which is not an error.
pub fn init_logging(format: LogFormat, default_level: &str) -> Result<bool, ConfigError> {
    let filter = build_env_filter(default_level)?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .is_ok(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()
            .is_ok(),
    };
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_repeated_init_is_harmless() {
        init_logging(LogFormat::Pretty, "warn").unwrap();
        assert!(!init_logging(LogFormat::Json, "warn").unwrap());
    }
}
