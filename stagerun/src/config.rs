//! Runtime configuration.
//!
//! A [`RuntimeConfig`] is loaded from JSON (every field optional), extended
//! by a [`RetryFile`] and finally overridden by `MRO_*` environment variables
//! through [`RuntimeConfig::apply_env`].

use crate::errors::ConfigError;
use crate::jobinfo::ProfileMode;
use crate::jobmanager::{JobModeConfig, LocalConfig};
use crate::monitor::MonitorConfig;
use crate::observability::LogFormat;
use crate::vdr::VdrPolicy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Forces whole-node resets on retry.
pub const ENV_FULL_STAGE_RESET: &str = "MRO_FULLSTAGERESET";
/// `name:value;name:value` cluster resource mapping.
pub const ENV_JOB_RESOURCES: &str = "MRO_JOBRESOURCES";
/// Retry budget override.
pub const ENV_AUTO_RETRY: &str = "MRO_AUTORETRY";
/// VDR policy override.
pub const ENV_VDR_MODE: &str = "MRO_VDRMODE";
/// Enforces memory and thread quotas when truthy.
pub const ENV_MONITOR: &str = "MRO_MONITOR";
/// Profiler attached to every job.
pub const ENV_PROFILE: &str = "MRO_PROFILE";

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Supervisor poll loop timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Time between cycles when nothing wakes the loop early.
    pub interval_ms: u64,
    /// Time between cluster queue checks.
    pub queue_check_interval_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3_000,
            queue_check_interval_secs: 300,
        }
    }
}

impl PollConfig {
    /// The poll interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Lost-heartbeat detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// A running job silent for longer than this is failed.
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { timeout_secs: 3_600 }
    }
}

impl HeartbeatConfig {
    /// The heartbeat timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Automatic retry of transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry tokens for the whole run.
    pub max_retries: u32,
    /// Wait after a transient failure before resetting, collecting further failures.
    pub wait_secs: u64,
    /// Reset whole nodes instead of the failed phase.
    pub full_reset: bool,
    /// Extra transient signatures.
    pub retry_on: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            wait_secs: 60,
            full_reset: false,
            retry_on: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// The wait before a retry.
    #[must_use]
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

/// State query interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// Whether to serve the interface.
    pub enabled: bool,
    /// Listen address.
    pub bind: String,
    /// Bearer token; requests are refused when unset.
    pub token: Option<String>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:0".to_string(),
            token: None,
        }
    }
}

/// Everything the supervisor needs besides the call graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Poll loop timing.
    pub poll: PollConfig,
    /// Lost-heartbeat detection.
    pub heartbeat: HeartbeatConfig,
    /// Automatic retries.
    pub retry: RetryConfig,
    /// Volatile data removal.
    pub vdr: VdrPolicy,
    /// Job monitor settings, including the thread quota.
    pub monitor: MonitorConfig,
    /// Local job manager.
    pub local: LocalConfig,
    /// Cluster job mode; local only when absent.
    pub cluster: Option<JobModeConfig>,
    /// State query interface.
    pub ui: UiConfig,
    /// Log line format.
    pub log_format: LogFormat,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Seconds to stay alive after the run ends so the interface can be read.
    pub linger_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            retry: RetryConfig::default(),
            vdr: VdrPolicy::default(),
            monitor: MonitorConfig::default(),
            local: LocalConfig::default(),
            cluster: None,
            ui: UiConfig::default(),
            log_format: LogFormat::default(),
            log_level: "info".to_string(),
            linger_secs: 0,
        }
    }
}

impl RuntimeConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_json(path.as_ref())
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll.interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the heartbeat timeout.
    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat.timeout_secs = timeout.as_secs();
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.retry.max_retries = retries;
        self
    }

    /// Sets the wait before a retry.
    #[must_use]
    pub fn with_retry_wait(mut self, wait: Duration) -> Self {
        self.retry.wait_secs = wait.as_secs();
        self
    }

    /// Sets the VDR policy.
    #[must_use]
    pub fn with_vdr(mut self, policy: VdrPolicy) -> Self {
        self.vdr = policy;
        self
    }

    /// Sets the job monitor settings.
    #[must_use]
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Sets the cluster job mode.
    #[must_use]
    pub fn with_cluster(mut self, cluster: JobModeConfig) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Merges a retry file into the retry settings.
    pub fn apply_retry_file(&mut self, file: &RetryFile) {
        if let Some(retries) = file.default_retries {
            self.retry.max_retries = retries;
        }
        self.retry.retry_on.extend(file.retry_on.iter().cloned());
    }

    /// Applies `MRO_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_FULL_STAGE_RESET) {
            self.retry.full_reset = is_truthy(&value);
        }
        if let Some(value) = lookup(ENV_AUTO_RETRY) {
            self.retry.max_retries = value.trim().parse().map_err(|_| {
                ConfigError::invalid_value(ENV_AUTO_RETRY, format!("'{value}' is not a retry count"))
            })?;
        }
        if let Some(value) = lookup(ENV_VDR_MODE) {
            self.vdr = value.parse()?;
        }
        if let Some(value) = lookup(ENV_MONITOR) {
            self.monitor.enforce = is_truthy(&value);
        }
        if let Some(value) = lookup(ENV_PROFILE) {
            self.monitor.profile_mode = value.parse::<ProfileMode>().unwrap_or_default();
        }
        if let Some(value) = lookup(ENV_JOB_RESOURCES) {
            let mapping = JobModeConfig::parse_job_resources(&value)?;
            match self.cluster.as_mut() {
                Some(cluster) => cluster.job_resources.extend(mapping),
                None => debug!("{ENV_JOB_RESOURCES} ignored without a cluster job mode"),
            }
        }
        Ok(())
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

/// Retry policy file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryFile {
    /// Retry budget.
    pub default_retries: Option<u32>,
    /// Additional transient signatures.
    pub retry_on: Vec<String>,
}

impl RetryFile {
    /// Loads a retry file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_json(path.as_ref())
    }
}
