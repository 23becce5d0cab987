//! Runs jobs as child processes of the supervisor.

use super::{JobManager, JobRequest, ResourceLimits};
use crate::core::{JobResources, ResourceRequest};
use crate::errors::JobManagerError;
use crate::jobinfo::JobInfo;
use crate::metadata::{Metadata, MetadataFile};
use crate::monitor::MonitorConfig;
use crate::signals::SignalRegistry;
use crate::sys::{self, Signal};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Write};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::process::Command;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

/// Exit code the job monitor uses to ask for a respawn (`EX_TEMPFAIL`).
pub const RETRY_EXIT_CODE: i32 = 75;

/// Settings for the local job manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Core budget; `None` uses every logical core of the host.
    pub max_cores: Option<u32>,
    /// Memory budget in GB; `None` uses the host's total memory.
    pub max_mem_gb: Option<u32>,
    /// Threads for a job that requests zero.
    pub default_threads: u32,
    /// Memory for a job that requests zero.
    pub default_mem_gb: u32,
    /// Withhold submissions while the load average exceeds the free cores.
    pub limit_load: bool,
    /// Command prefix that wraps every job, normally the job monitor.
    /// Empty runs the worker directly.
    pub monitor: Vec<String>,
    /// Variables set to the job's thread reservation.
    pub thread_envs: Vec<String>,
    /// Attempts to start a job that fails with a transient spawn error.
    pub spawn_attempts: u32,
    /// First wait between spawn attempts; doubles each time.
    pub spawn_retry_wait_ms: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_cores: None,
            max_mem_gb: None,
            default_threads: 1,
            default_mem_gb: 1,
            limit_load: false,
            monitor: vec!["stagerun-monitor".to_string()],
            thread_envs: default_thread_envs(),
            spawn_attempts: 5,
            spawn_retry_wait_ms: 2000,
        }
    }
}

pub(crate) fn default_thread_envs() -> Vec<String> {
    ["OMP_NUM_THREADS", "OPENBLAS_NUM_THREADS", "MKL_NUM_THREADS", "MRO_THREADS"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

impl LocalConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the core budget.
    #[must_use]
    pub fn with_max_cores(mut self, cores: u32) -> Self {
        self.max_cores = Some(cores);
        self
    }

    /// Sets the memory budget.
    #[must_use]
    pub fn with_max_mem_gb(mut self, mem_gb: u32) -> Self {
        self.max_mem_gb = Some(mem_gb);
        self
    }

    /// Sets the wrapper command.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Vec<String>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Enables load-average limiting.
    #[must_use]
    pub fn with_limit_load(mut self, enabled: bool) -> Self {
        self.limit_load = enabled;
        self
    }
}

type LoadSource = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Runs jobs on this host within a core and memory budget.
pub struct LocalJobManager {
    config: LocalConfig,
    limits: ResourceLimits,
    cores: Arc<Semaphore>,
    mem_mb: Arc<Semaphore>,
    host_cores: u32,
    load: LoadSource,
    last_load: Mutex<f64>,
    running: Arc<DashMap<String, u32>>,
    signals: Arc<SignalRegistry>,
    done: Arc<Notify>,
    monitor_settings: Option<MonitorConfig>,
}

impl std::fmt::Debug for LocalJobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalJobManager")
            .field("limits", &self.limits)
            .field("free_cores", &self.cores.available_permits())
            .field("free_mem_mb", &self.mem_mb.available_permits())
            .field("running", &self.running.len())
            .finish()
    }
}

impl LocalJobManager {
    /// Creates a manager sized from `config` and the host.
    #[must_use]
    pub fn new(config: LocalConfig, signals: Arc<SignalRegistry>) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let host_cores = u32::try_from(num_cpus()).unwrap_or(1).max(1);
        let host_mem_gb = u32::try_from(system.total_memory() >> 30).unwrap_or(u32::MAX);

        let max_cores = config.max_cores.unwrap_or(host_cores).max(1);
        let max_mem_gb = config.max_mem_gb.unwrap_or(host_mem_gb).max(1);
        info!(max_cores, max_mem_gb, "local job manager budget");

        let limits = ResourceLimits {
            max_threads: max_cores,
            max_mem_gb,
            default_threads: config.default_threads.max(1),
            default_mem_gb: config.default_mem_gb.max(1),
        };
        let manager = Self {
            limits,
            cores: Arc::new(Semaphore::new(max_cores as usize)),
            mem_mb: Arc::new(Semaphore::new(max_mem_gb as usize * 1024)),
            host_cores,
            load: Arc::new(|| System::load_average().one),
            last_load: Mutex::new(0.0),
            running: Arc::new(DashMap::new()),
            signals,
            done: Arc::new(Notify::new()),
            monitor_settings: None,
            config,
        };
        manager.register_cleanup();
        manager
    }

    /// Replaces the load-average source.
    #[must_use]
    pub fn with_load_source<F>(mut self, load: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.load = Arc::new(load);
        self
    }

    /// Hands `settings` to the monitor of every job through `_jobinfo`.
    #[must_use]
    pub fn with_monitor_settings(mut self, settings: MonitorConfig) -> Self {
        self.monitor_settings = Some(settings);
        self
    }

    /// Cores not reserved by running jobs.
    #[must_use]
    pub fn free_cores(&self) -> u32 {
        u32::try_from(self.cores.available_permits()).unwrap_or(u32::MAX)
    }

    /// Memory not reserved by running jobs, in MB.
    #[must_use]
    pub fn free_mem_mb(&self) -> u64 {
        self.mem_mb.available_permits() as u64
    }

    fn register_cleanup(&self) {
        let running = Arc::clone(&self.running);
        self.signals.register("local-jobs", move || {
            let pids: Vec<u32> = running.iter().map(|e| *e.value()).collect();
            async move {
                for pid in pids {
                    if let Err(e) = sys::send_signal(pid, Signal::Terminate) {
                        debug!(pid, error = %e, "could not signal job");
                    }
                }
            }
        });
    }

    fn load_allows(&self, threads: u32) -> bool {
        if !self.config.limit_load {
            return true;
        }
        let free = f64::from(self.host_cores) - *self.last_load.lock() + 0.9;
        free >= f64::from(threads)
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

#[async_trait]
impl JobManager for LocalJobManager {
    fn resources(
        &self,
        request: &ResourceRequest,
        _local: bool,
    ) -> Result<JobResources, JobManagerError> {
        Ok(self.limits.normalise(request)?)
    }

    fn can_submit(&self, resources: &JobResources, _local: bool) -> bool {
        self.free_cores() >= resources.threads
            && self.free_mem_mb() >= resources.mem_mb()
            && self.load_allows(resources.threads)
    }

    fn submit(&self, job: JobRequest) -> Result<(), JobManagerError> {
        let resources = self.limits.normalise(&job.resources)?;
        let mut info = JobInfo::new(job.fqname.clone(), "local").with_resources(
            resources.threads,
            resources.mem_gb,
            resources.vmem_gb,
        );
        if let Some(settings) = &self.monitor_settings {
            info = info.with_monitor_settings(settings);
        }
        job.metadata.write(MetadataFile::JobInfo, &info)?;
        job.metadata.write_time(MetadataFile::QueuedLocally)?;
        job.metadata.update_journal(MetadataFile::JobInfo);

        let mut argv = self.config.monitor.clone();
        argv.extend(job.worker_argv());
        let launch = Launch {
            argv,
            metadata: job.metadata,
            fqname: job.fqname,
            threads: resources.threads,
            mem_mb: resources.mem_mb(),
            thread_envs: self.config.thread_envs.clone(),
            env: job.env.into_iter().collect(),
            attempts: self.config.spawn_attempts.max(1),
            retry_wait: Duration::from_millis(self.config.spawn_retry_wait_ms),
        };
        let cores = Arc::clone(&self.cores);
        let mem = Arc::clone(&self.mem_mb);
        let running = Arc::clone(&self.running);
        let signals = Arc::clone(&self.signals);
        let done = Arc::clone(&self.done);
        tokio::spawn(async move {
            launch.run(cores, mem, running, signals).await;
            done.notify_one();
        });
        Ok(())
    }

    fn max_cores(&self) -> u32 {
        self.limits.max_threads
    }

    fn max_mem_gb(&self) -> u32 {
        self.limits.max_mem_gb
    }

    fn refresh_resources(&self) {
        if self.config.limit_load {
            *self.last_load.lock() = (self.load)();
        }
    }

    fn done(&self) -> Arc<Notify> {
        Arc::clone(&self.done)
    }

    fn is_local(&self) -> bool {
        true
    }
}

struct Launch {
    argv: Vec<String>,
    metadata: Metadata,
    fqname: String,
    threads: u32,
    mem_mb: u64,
    thread_envs: Vec<String>,
    env: Vec<(String, String)>,
    attempts: u32,
    retry_wait: Duration,
}

impl Launch {
    async fn run(
        self,
        cores: Arc<Semaphore>,
        mem: Arc<Semaphore>,
        running: Arc<DashMap<String, u32>>,
        signals: Arc<SignalRegistry>,
    ) {
        let mem_permits = u32::try_from(self.mem_mb).unwrap_or(u32::MAX);
        let Ok(_cores) = cores.acquire_many_owned(self.threads).await else {
            return;
        };
        let Ok(_mem) = mem.acquire_many_owned(mem_permits).await else {
            return;
        };
        debug!(fqname = %self.fqname, threads = self.threads, mem_mb = self.mem_mb, "reservation acquired");

        let key = self.metadata.journal_name().to_string();
        let mut wait = self.retry_wait;
        for attempt in 1..=self.attempts {
            let started = {
                let _section = signals.critical_section().await;
                if signals.is_shutting_down() {
                    return;
                }
                if let Err(e) = self.metadata.remove(MetadataFile::QueuedLocally) {
                    warn!(fqname = %self.fqname, error = %e, "could not clear local queue marker");
                }
                self.spawn()
            };
            let result = match started {
                Ok(mut child) => {
                    if let Some(pid) = child.id() {
                        running.insert(key.clone(), pid);
                    }
                    let status = child.wait().await;
                    running.remove(&key);
                    status
                }
                Err(e) => Err(e),
            };
            let retryable = match &result {
                Ok(status) => status.code() == Some(RETRY_EXIT_CODE),
                Err(e) => e.raw_os_error() == Some(libc::EAGAIN),
            };
            if retryable && attempt < self.attempts {
                info!(
                    fqname = %self.fqname,
                    attempt,
                    wait_secs = wait.as_secs_f64(),
                    "job could not start, retrying"
                );
                tokio::time::sleep(wait).await;
                wait *= 2;
                continue;
            }
            self.finish(result);
            return;
        }
    }

    fn spawn(&self) -> io::Result<tokio::process::Child> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty job command"));
        };
        self.metadata
            .mkdirs()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let stdout = stream_file(&self.metadata, MetadataFile::Stdout)?;
        let stderr = stream_file(&self.metadata, MetadataFile::Stderr)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(self.metadata.files_path())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        let threads = self.threads.to_string();
        for name in &self.thread_envs {
            command.env(name, &threads);
        }
        command.envs(self.env.iter().map(|(k, v)| (k, v)));
        command.spawn()
    }

    fn finish(&self, result: io::Result<ExitStatus>) {
        let message = match result {
            Ok(status) if status.success() => return,
            Ok(status) => status.to_string(),
            Err(e) => format!("Failed to start job: {e}"),
        };
        let mut meta = self.metadata.clone();
        if meta.refresh().is_ok() && meta.state().is_active() {
            warn!(fqname = %self.fqname, error = %message, "job exited without reporting");
            if meta.write_raw(MetadataFile::Errors, &message).is_ok() {
                meta.update_journal(MetadataFile::Errors);
            }
        }
    }
}

fn stream_file(metadata: &Metadata, file: MetadataFile) -> io::Result<File> {
    let mut handle = File::create(metadata.metadata_file_path(file))?;
    let header = match file {
        MetadataFile::Stdout => "[stdout]\n",
        _ => "[stderr]\n",
    };
    handle.write_all(header.as_bytes())?;
    Ok(handle)
}
