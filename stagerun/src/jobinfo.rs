//! Resource and runtime accounting for one job attempt.
//!
//! The job manager writes the initial record when it queues the job, carrying
//! the run's monitor settings; the job monitor stamps it with process details at start, refreshes the memory
//! high-water mark while the job runs and finalizes it at exit. Every write
//! goes through the metadata store's atomic rename.

use crate::monitor::MonitorConfig;
use crate::perf::{IoStats, ObservedMemory, RusageInfo};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;

/// Profiler attached to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileMode {
    /// No profiling.
    #[default]
    Disable,
    /// CPU sampling profiler.
    Cpu,
    /// Memory profiler.
    Mem,
    /// `perf record` against the worker pid.
    Perf,
    /// A named custom profiler from the monitor configuration.
    Custom(String),
}

impl ProfileMode {
    /// Returns true if a profiler should be started.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disable)
    }

    /// Key used to look up the profiler command.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Disable => "disable",
            Self::Cpu => "cpu",
            Self::Mem => "mem",
            Self::Perf => "perf",
            Self::Custom(name) => name,
        }
    }
}

impl FromStr for ProfileMode {
    type Err = std::convert::Infallible;

    /// Known modes match case-insensitively; any other name is a custom profiler.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Ok(match name.to_ascii_lowercase().as_str() {
            "" | "disable" => Self::Disable,
            "cpu" => Self::Cpu,
            "mem" => Self::Mem,
            "perf" => Self::Perf,
            _ => Self::Custom(name.to_string()),
        })
    }
}

/// Start, end and duration of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WallClock {
    /// When the monitor started the worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    /// When the worker exited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// Elapsed seconds.
    #[serde(default)]
    pub duration_seconds: f64,
}

impl WallClock {
    /// Records the end time and duration.
    pub fn finish(&mut self, end: DateTime<Utc>) {
        if let Some(start) = self.start {
            self.duration_seconds = (end - start).num_milliseconds() as f64 / 1000.0;
        }
        self.end = Some(end);
    }
}

/// Accounting record stored in `_jobinfo`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobInfo {
    /// Fully-qualified node name.
    pub name: String,
    /// Monitor pid, zero until the job starts.
    pub pid: u32,
    /// Host the job runs on.
    pub host: String,
    /// Job mode that launched the job (`local` or a cluster name).
    #[serde(rename = "type")]
    pub job_type: String,
    /// Working directory of the job.
    pub cwd: String,
    /// Reserved threads.
    pub threads: u32,
    /// Reserved memory in GB.
    #[serde(rename = "memGB")]
    pub mem_gb: u32,
    /// Reserved virtual memory in GB, zero when unlimited.
    #[serde(rename = "vmemGB")]
    pub vmem_gb: u32,
    /// Profiler to attach.
    pub profile_mode: ProfileMode,
    /// Whether quotas are enforced rather than only logged.
    pub monitor_flag: bool,
    /// Settings the monitor runs this job with, overriding its own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorConfig>,
    /// Cluster scheduler variables captured at start.
    pub cluster_env: BTreeMap<String, String>,
    /// Kernel resource usage at exit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rusage: Option<RusageInfo>,
    /// Memory high-water mark of the process tree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_bytes: Option<ObservedMemory>,
    /// I/O totals of the process tree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io: Option<IoStats>,
    /// Timing.
    pub wallclock: WallClock,
}

impl JobInfo {
    /// Creates the record a job manager writes when queueing a job.
    #[must_use]
    pub fn new(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            ..Self::default()
        }
    }

    /// Sets the reservation.
    #[must_use]
    pub fn with_resources(mut self, threads: u32, mem_gb: u32, vmem_gb: u32) -> Self {
        self.threads = threads;
        self.mem_gb = mem_gb;
        self.vmem_gb = vmem_gb;
        self
    }

    /// Sets the profile mode.
    #[must_use]
    pub fn with_profile_mode(mut self, mode: ProfileMode) -> Self {
        self.profile_mode = mode;
        self
    }

    /// Sets whether quotas are enforced.
    #[must_use]
    pub fn with_monitor_flag(mut self, enforce: bool) -> Self {
        self.monitor_flag = enforce;
        self
    }

    /// Applies the run's monitor settings: enforcement, profiling and the
    /// configuration the job's monitor will use.
    #[must_use]
    pub fn with_monitor_settings(mut self, settings: &MonitorConfig) -> Self {
        self.monitor_flag = settings.enforce;
        self.profile_mode = settings.profile_mode.clone();
        self.monitor = Some(settings.clone());
        self
    }

    /// Records the peak of a new memory sample.
    pub fn observe_memory(&mut self, sample: &ObservedMemory) {
        self.used_bytes
            .get_or_insert_with(ObservedMemory::default)
            .increase_to(sample);
    }
}

#[allow(clippy::unwrap_used)]
fn cluster_env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(?:EGO|SGE|LS[BF]|PBS|SLURM|JOB)_[^O]").unwrap())
}

/// Selects the cluster scheduler variables worth keeping for diagnostics.
///
/// Variables of the form `SGE_O_*` (submission-host copies) are skipped.
pub fn capture_cluster_env<I, K, V>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    vars.into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .filter(|(k, _)| cluster_env_pattern().is_match(k))
        .collect()
}
