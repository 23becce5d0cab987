//! Admission control and job launch.
//!
//! A job manager decides when a ready job may start and how it is launched:
//! - [`LocalJobManager`] runs the job monitor as a child process, gated by a
//!   core and memory budget
//! - [`ClusterJobManager`] renders a submission script and hands it to a
//!   cluster scheduler, gated by an outstanding-jobs limit and a rate limit
//!
//! Both write `_jobinfo` when they accept a job, which moves the job's
//! metadata to the queued state.

mod cluster;
mod local;
mod template;

pub use cluster::{ClusterJobManager, JobModeConfig};
pub use local::{LocalConfig, LocalJobManager, RETRY_EXIT_CODE};
pub use template::{render_template, TemplateParams};

use crate::core::{JobResources, ResourceRequest};
use crate::errors::{ConfigError, JobManagerError, ResourceExceededError, ResourceKind};
use crate::metadata::Metadata;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Phase of a stage a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobMode {
    /// Computes the chunk definitions.
    Split,
    /// Runs one chunk, or the whole stage if it does not split.
    Main,
    /// Combines chunk outputs.
    Join,
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Split => write!(f, "split"),
            Self::Main => write!(f, "main"),
            Self::Join => write!(f, "join"),
        }
    }
}

impl std::str::FromStr for JobMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "split" => Ok(Self::Split),
            "main" => Ok(Self::Main),
            "join" => Ok(Self::Join),
            other => Err(ConfigError::invalid_value("mode", format!("unknown job mode '{other}'"))),
        }
    }
}

/// A job handed to a job manager.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Fully-qualified name of the stage.
    pub fqname: String,
    /// Phase the job runs.
    pub mode: JobMode,
    /// Metadata of the phase or chunk.
    pub metadata: Metadata,
    /// Stage executable and fixed arguments.
    pub command: Vec<String>,
    /// Requested resources, before normalisation.
    pub resources: ResourceRequest,
    /// Must run on this host even under a cluster job mode.
    pub local: bool,
    /// Extra environment for the job.
    pub env: BTreeMap<String, String>,
}

impl JobRequest {
    /// Creates a job request.
    #[must_use]
    pub fn new(
        fqname: impl Into<String>,
        mode: JobMode,
        metadata: Metadata,
        command: Vec<String>,
        resources: ResourceRequest,
    ) -> Self {
        Self {
            fqname: fqname.into(),
            mode,
            metadata,
            command,
            resources,
            local: false,
            env: BTreeMap::new(),
        }
    }

    /// Marks the job as local-only.
    #[must_use]
    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// The prefix the worker uses for its journal markers.
    #[must_use]
    pub fn journal_prefix(&self) -> String {
        self.metadata
            .journal()
            .dir()
            .join(self.metadata.journal_name())
            .display()
            .to_string()
    }

    /// The worker invocation:
    /// `<executable> [args...] <mode> <metadata_path> <files_path> <journal_prefix>`.
    #[must_use]
    pub fn worker_argv(&self) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.push(self.mode.to_string());
        argv.push(self.metadata.path().display().to_string());
        argv.push(self.metadata.files_path().display().to_string());
        argv.push(self.journal_prefix());
        argv
    }

    /// Name shown in scheduler queues.
    #[must_use]
    pub fn job_name(&self) -> String {
        format!("{}.{}", self.metadata.journal_name(), self.mode)
    }
}

/// Bounds and defaults used to turn a [`ResourceRequest`] into a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Largest thread reservation; zero means unbounded.
    pub max_threads: u32,
    /// Largest memory reservation in GB; zero means unbounded.
    pub max_mem_gb: u32,
    /// Threads used when the request says zero.
    pub default_threads: u32,
    /// Memory used when the request says zero.
    pub default_mem_gb: u32,
}

impl ResourceLimits {
    /// Normalises a request.
    ///
    /// Zero selects the default and a negative value selects the maximum.
    /// An explicit request above the maximum can never be granted.
    pub fn normalise(&self, request: &ResourceRequest) -> Result<JobResources, ResourceExceededError> {
        let threads = normalise_one(
            request.threads,
            self.default_threads,
            self.max_threads,
            ResourceKind::Threads,
        )?;
        let mem_gb = normalise_one(
            request.mem_gb,
            self.default_mem_gb,
            self.max_mem_gb,
            ResourceKind::MemoryGb,
        )?;
        Ok(JobResources {
            threads,
            mem_gb,
            vmem_gb: u32::try_from(request.vmem_gb).unwrap_or(0),
            special: request.special.clone(),
        })
    }
}

fn normalise_one(
    requested: i32,
    default: u32,
    max: u32,
    kind: ResourceKind,
) -> Result<u32, ResourceExceededError> {
    let value = match u32::try_from(requested) {
        Ok(0) => default,
        Ok(n) if max > 0 && n > max => {
            return Err(ResourceExceededError::new(kind, f64::from(n), f64::from(max)));
        }
        Ok(n) => n,
        Err(_) if max > 0 => max,
        Err(_) => default,
    };
    Ok(if max > 0 { value.clamp(1, max) } else { value.max(1) })
}

/// Contract shared by local and cluster job managers.
#[async_trait]
pub trait JobManager: Send + Sync {
    /// Turns a request into the reservation this manager would grant.
    fn resources(&self, request: &ResourceRequest, local: bool)
        -> Result<JobResources, JobManagerError>;

    /// Returns true if a job with this reservation may be submitted now.
    fn can_submit(&self, resources: &JobResources, local: bool) -> bool;

    /// Accepts a job: writes `_jobinfo` and starts launching it in the background.
    fn submit(&self, job: JobRequest) -> Result<(), JobManagerError>;

    /// Largest thread reservation.
    fn max_cores(&self) -> u32;

    /// Largest memory reservation in GB.
    fn max_mem_gb(&self) -> u32;

    /// Re-reads dynamic limits such as the load average.
    fn refresh_resources(&self) {}

    /// Notified whenever a job managed by this manager finishes.
    fn done(&self) -> Arc<Notify>;

    /// Journal names of submitted jobs the scheduler no longer knows about.
    async fn check_queue(&self) -> Vec<String> {
        Vec::new()
    }

    /// How long a job may be missing from the queue before it is failed.
    fn queue_check_grace(&self) -> Option<Duration> {
        None
    }

    /// Whether this manager runs jobs on this host.
    fn is_local(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Journal;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            max_threads: 4,
            max_mem_gb: 8,
            default_threads: 1,
            default_mem_gb: 2,
        }
    }

    #[test]
    fn test_normalise_defaults_and_max() {
        let res = limits().normalise(&ResourceRequest::new(0, 0)).unwrap();
        assert_eq!((res.threads, res.mem_gb), (1, 2));
        let res = limits().normalise(&ResourceRequest::new(-1, -1)).unwrap();
        assert_eq!((res.threads, res.mem_gb), (4, 8));
        let res = limits().normalise(&ResourceRequest::new(2, 4)).unwrap();
        assert_eq!((res.threads, res.mem_gb), (2, 4));
    }

    #[test]
    fn test_normalise_rejects_explicit_excess() {
        let err = limits().normalise(&ResourceRequest::new(16, 1)).unwrap_err();
        assert_eq!(err.resource, ResourceKind::Threads);
        assert_eq!(err.max, 4.0);
        let err = limits().normalise(&ResourceRequest::new(1, 9)).unwrap_err();
        assert_eq!(err.resource, ResourceKind::MemoryGb);
    }

    #[test]
    fn test_normalise_unbounded() {
        let unbounded = ResourceLimits {
            max_threads: 0,
            max_mem_gb: 0,
            default_threads: 1,
            default_mem_gb: 1,
        };
        let res = unbounded.normalise(&ResourceRequest::new(64, 512)).unwrap();
        assert_eq!((res.threads, res.mem_gb), (64, 512));
        let res = unbounded.normalise(&ResourceRequest::new(-1, -1)).unwrap();
        assert_eq!((res.threads, res.mem_gb), (1, 1));
    }

    #[test]
    fn test_worker_argv() {
        let journal = Arc::new(Journal::new("/run/journal"));
        let meta = Metadata::new("p.S", "p.S.chnk0", "/run/p/S/chnk0", journal);
        let job = JobRequest::new(
            "p.S",
            JobMode::Main,
            meta,
            vec!["/opt/stage".into(), "--fast".into()],
            ResourceRequest::default(),
        );
        assert_eq!(
            job.worker_argv(),
            vec![
                "/opt/stage",
                "--fast",
                "main",
                "/run/p/S/chnk0",
                "/run/p/S/chnk0/files",
                "/run/journal/p.S.chnk0",
            ]
        );
        assert_eq!(job.job_name(), "p.S.chnk0.main");
    }
}
