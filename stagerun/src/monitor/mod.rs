//! The job monitor.
//!
//! One monitor runs one attempt of one job phase:
//! 1. stamps `_jobinfo` with its pid, host and cluster environment
//! 2. starts the worker with an error channel on fd 4
//! 3. samples the worker's process tree, enforcing the memory quota,
//!    writing heartbeats and watching for `_log` to disappear
//! 4. reports the outcome as `_complete`, `_errors` or `_assert`
//!
//! Starting the worker and reporting the outcome run inside critical
//! sections of the [`SignalRegistry`].

mod joblog;
mod profiler;
mod quota;

pub use joblog::JobLog;
pub use profiler::{default_profilers, Profiler, OUTPUT_PLACEHOLDER, PID_PLACEHOLDER};
pub use quota::{MemoryQuota, ThreadQuota};

use crate::errors::MonitorError;
use crate::jobinfo::{capture_cluster_env, JobInfo, ProfileMode};
use crate::jobmanager::{JobMode, RETRY_EXIT_CODE};
use crate::metadata::{Journal, Metadata, MetadataFile};
use crate::perf::{default_process_tree, IoAmount, IoStats, ProcessTreeMemory, RusageInfo};
use crate::signals::SignalRegistry;
use crate::sys::{self, Signal};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Prefix on the error channel that marks an assertion.
pub const ASSERT_PREFIX: &str = "ASSERT:";

const WORKER_CLEANUP: &str = "worker";

/// Command line of the monitor:
/// `<executable> [args...] <mode> <metadata_path> <files_path> <journal_prefix>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorArgs {
    /// Stage executable and its fixed arguments.
    pub command: Vec<String>,
    /// Phase the worker runs.
    pub mode: JobMode,
    /// Metadata directory of the phase.
    pub metadata_path: PathBuf,
    /// Directory the worker writes its files to.
    pub files_path: PathBuf,
    /// Journal directory joined with the phase's journal name.
    pub journal_prefix: PathBuf,
}

impl MonitorArgs {
    /// Parses the monitor's arguments, without the program name.
    pub fn parse(argv: &[String]) -> Result<Self, MonitorError> {
        if argv.len() < 5 {
            return Err(MonitorError::Setup(format!(
                "expected <command> [args...] <mode> <metadata_path> <files_path> <journal_prefix>, got {} arguments",
                argv.len()
            )));
        }
        let (command, tail) = argv.split_at(argv.len() - 4);
        let mode = tail[0]
            .parse()
            .map_err(|e: crate::errors::ConfigError| MonitorError::Setup(e.to_string()))?;
        Ok(Self {
            command: command.to_vec(),
            mode,
            metadata_path: PathBuf::from(&tail[1]),
            files_path: PathBuf::from(&tail[2]),
            journal_prefix: PathBuf::from(&tail[3]),
        })
    }

    /// The worker invocation, which is the monitor's own arguments.
    #[must_use]
    pub fn worker_argv(&self) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.push(self.mode.to_string());
        argv.push(self.metadata_path.display().to_string());
        argv.push(self.files_path.display().to_string());
        argv.push(self.journal_prefix.display().to_string());
        argv
    }

    /// Metadata handle of the phase, journaled under the prefix's name.
    pub fn metadata(&self) -> Result<Metadata, MonitorError> {
        let name = self
            .journal_prefix
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                MonitorError::Setup(format!("invalid journal prefix {}", self.journal_prefix.display()))
            })?;
        let dir = self.journal_prefix.parent().map(PathBuf::from).unwrap_or_default();
        Ok(Metadata::new(
            name,
            name,
            self.metadata_path.clone(),
            Arc::new(Journal::new(dir)),
        ))
    }
}

/// Settings of the job monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling period when quotas are only logged.
    pub sample_interval_ms: u64,
    /// Sampling period when quotas are enforced.
    pub active_sample_interval_ms: u64,
    /// Maximum time between heartbeat journal markers.
    pub heartbeat_interval_ms: u64,
    /// Wait between SIGTERM and SIGKILL.
    pub kill_grace_ms: u64,
    /// Retroactive CPU-thread check.
    pub thread_quota: ThreadQuota,
    /// Profiler command templates by profile mode.
    pub profilers: BTreeMap<String, Vec<String>>,
    /// Enter the files directory and become a subreaper before starting.
    pub process_setup: bool,
    /// Kill jobs that exceed their memory reservation and fail jobs that
    /// exceed the thread quota, instead of only logging the overage.
    pub enforce: bool,
    /// Profiler attached to every job.
    pub profile_mode: ProfileMode,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            active_sample_interval_ms: 1_000,
            heartbeat_interval_ms: 120_000,
            kill_grace_ms: 5_000,
            thread_quota: ThreadQuota::default(),
            profilers: default_profilers(),
            process_setup: true,
            enforce: false,
            profile_mode: ProfileMode::Disable,
        }
    }
}

impl MonitorConfig {
    /// Sets both sampling periods.
    #[must_use]
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self.sample_interval_ms = ms;
        self.active_sample_interval_ms = ms;
        self
    }

    /// Sets the heartbeat period.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the wait between SIGTERM and SIGKILL.
    #[must_use]
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the thread quota policy.
    #[must_use]
    pub fn with_thread_quota(mut self, quota: ThreadQuota) -> Self {
        self.thread_quota = quota;
        self
    }

    /// Enables or disables working-directory and subreaper setup.
    #[must_use]
    pub fn with_process_setup(mut self, enabled: bool) -> Self {
        self.process_setup = enabled;
        self
    }

    /// Enables or disables quota enforcement.
    #[must_use]
    pub fn with_enforce(mut self, enforce: bool) -> Self {
        self.enforce = enforce;
        self
    }

    /// Sets the profiler attached to every job.
    #[must_use]
    pub fn with_profile_mode(mut self, mode: ProfileMode) -> Self {
        self.profile_mode = mode;
        self
    }

    fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// How a job attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// The worker succeeded; `_complete` was written.
    Complete,
    /// The worker failed; `_errors` holds the message.
    Failed(String),
    /// The worker asserted; `_assert` holds the message.
    Assert(String),
    /// The node's metadata disappeared and the worker was stopped; nothing was written.
    Aborted(String),
    /// The worker could not be started for lack of system resources.
    RetrySpawn(String),
}

impl MonitorOutcome {
    /// Exit code of the monitor process.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::Failed(_) | Self::Assert(_) | Self::Aborted(_) => 1,
            Self::RetrySpawn(_) => RETRY_EXIT_CODE,
        }
    }
}

/// Formats a worker's exit the way failures are classified.
#[must_use]
pub fn describe_exit(status: ExitStatus) -> String {
    if let Some(signal) = status.signal() {
        return format!("signal: {}", signal_name(signal));
    }
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => status.to_string(),
    }
}

fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGHUP => "hangup",
        libc::SIGINT => "interrupt",
        libc::SIGQUIT => "quit",
        libc::SIGILL => "illegal instruction",
        libc::SIGABRT => "aborted",
        libc::SIGBUS => "bus error",
        libc::SIGFPE => "floating point exception",
        libc::SIGKILL => "killed",
        libc::SIGSEGV => "segmentation fault",
        libc::SIGPIPE => "broken pipe",
        libc::SIGTERM => "terminated",
        libc::SIGXCPU => "CPU time limit exceeded",
        libc::SIGXFSZ => "file size limit exceeded",
        other => return format!("signal {other}"),
    };
    name.to_string()
}

type ExitResult = io::Result<ExitStatus>;

struct Worker {
    pid: u32,
    exit: oneshot::Receiver<ExitResult>,
    errors: JoinHandle<String>,
    profiler: Option<Profiler>,
}

enum Watch {
    Exited(ExitResult),
    Killed(String),
    Aborted(String),
}

/// Runs and supervises one job attempt.
pub struct Monitor {
    args: MonitorArgs,
    config: MonitorConfig,
    metadata: Metadata,
    log: JobLog,
    tree: Arc<dyn ProcessTreeMemory>,
    signals: Arc<SignalRegistry>,
    info: JobInfo,
    io: IoAmount,
    stamped: bool,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("args", &self.args)
            .field("config", &self.config)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Creates a monitor for `args`.
    pub fn new(
        args: MonitorArgs,
        config: MonitorConfig,
        signals: Arc<SignalRegistry>,
    ) -> Result<Self, MonitorError> {
        let metadata = args.metadata()?;
        Ok(Self {
            log: JobLog::new(metadata.clone()),
            metadata,
            args,
            config,
            tree: default_process_tree(),
            signals,
            info: JobInfo::default(),
            io: IoAmount::default(),
            stamped: false,
        })
    }

    /// Replaces the process-tree sampler.
    #[must_use]
    pub fn with_process_tree(mut self, tree: Arc<dyn ProcessTreeMemory>) -> Self {
        self.tree = tree;
        self
    }

    /// Runs the attempt to completion and reports the outcome.
    pub async fn run(mut self) -> MonitorOutcome {
        if let Err(e) = self.init() {
            let outcome = MonitorOutcome::Failed(e.to_string());
            self.report(&outcome).await;
            return outcome;
        }
        let mut worker = match self.start().await {
            Ok(worker) => worker,
            Err(MonitorError::Spawn(e)) if e.raw_os_error() == Some(libc::EAGAIN) => {
                self.log.line(format!("Could not start worker, asking for a respawn: {e}"));
                return MonitorOutcome::RetrySpawn(e.to_string());
            }
            Err(e) => {
                let outcome = MonitorOutcome::Failed(e.to_string());
                self.report(&outcome).await;
                return outcome;
            }
        };
        let watch = self.watch(&mut worker).await;
        let outcome = self.conclude(watch, worker).await;
        self.report(&outcome).await;
        outcome
    }

    fn init(&mut self) -> Result<(), MonitorError> {
        self.info = self
            .metadata
            .read_into(MetadataFile::JobInfo)
            .map_err(MonitorError::JobInfo)?;
        if let Some(settings) = &self.info.monitor {
            debug!(name = %self.metadata.journal_name(), "using monitor settings from job info");
            self.config = settings.clone();
        }
        if self.config.process_setup {
            std::env::set_current_dir(&self.args.files_path).map_err(|e| {
                MonitorError::Setup(format!("could not enter {}: {e}", self.args.files_path.display()))
            })?;
            if let Err(e) = sys::set_child_subreaper() {
                warn!(error = %e, "could not become a subreaper");
            }
        }
        self.info.pid = std::process::id();
        self.info.host = System::host_name().unwrap_or_default();
        self.info.cluster_env = capture_cluster_env(std::env::vars());
        self.info.cwd = self.args.files_path.display().to_string();
        self.info.wallclock.start = Some(Utc::now());
        self.metadata.write(MetadataFile::JobInfo, &self.info)?;
        self.stamped = true;
        self.log.line(format!(
            "Monitoring {} {} on {} (pid {}, {} threads, {} GB)",
            self.metadata.journal_name(),
            self.args.mode,
            self.info.host,
            self.info.pid,
            self.info.threads,
            self.info.mem_gb
        ));
        Ok(())
    }

    async fn start(&mut self) -> Result<Worker, MonitorError> {
        let _section = self.signals.critical_section().await;
        let (read, write) = sys::pipe()?;
        let argv = self.args.worker_argv();
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| MonitorError::Setup("empty worker command".to_string()))?;
        let mut command = Command::new(program);
        command
            .args(rest)
            .current_dir(&self.args.files_path)
            .stdin(Stdio::null());
        let vmem = (self.info.vmem_gb > 0).then(|| u64::from(self.info.vmem_gb) * quota::GB);
        sys::prepare_worker(&mut command, write.as_raw_fd(), vmem);
        let mut child = command.spawn().map_err(MonitorError::Spawn)?;
        drop(write);
        let pid = child
            .id()
            .ok_or_else(|| MonitorError::Setup("worker exited before it was observed".to_string()))?;

        let (tx, exit) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(child.wait().await);
        });
        let errors = tokio::task::spawn_blocking(move || {
            let mut text = String::new();
            if let Err(e) = File::from(read).read_to_string(&mut text) {
                debug!(error = %e, "error channel read failed");
            }
            text
        });
        self.signals.register(WORKER_CLEANUP, move || async move {
            if let Err(e) = sys::send_signal(pid, Signal::Terminate) {
                debug!(pid, error = %e, "worker already gone");
            }
        });
        let profiler = Profiler::start(
            &self.info.profile_mode,
            &self.config.profilers,
            pid,
            &self.args.files_path,
        );
        info!(name = %self.metadata.journal_name(), pid, "worker started");
        self.log.line(format!("Started {} as pid {pid}", self.args.mode));
        Ok(Worker {
            pid,
            exit,
            errors,
            profiler,
        })
    }

    async fn watch(&mut self, worker: &mut Worker) -> Watch {
        let period = if self.info.monitor_flag {
            self.config.active_sample_interval_ms
        } else {
            self.config.sample_interval_ms
        };
        let mut ticker = tokio::time::interval(Duration::from_millis(period.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let heartbeat = Duration::from_millis(self.config.heartbeat_interval_ms);
        let quota = MemoryQuota::from_jobinfo(&self.info);
        let exclude: Vec<u32> = worker.profiler.as_ref().and_then(Profiler::pid).into_iter().collect();
        let mut last_heartbeat = Instant::now();
        let mut overage_logged = false;

        loop {
            tokio::select! {
                status = &mut worker.exit => {
                    return Watch::Exited(status.unwrap_or_else(|_| {
                        Err(io::Error::new(io::ErrorKind::Other, "worker wait task ended"))
                    }));
                }
                _ = ticker.tick() => {}
            }

            match self.tree.sample(worker.pid, &exclude) {
                Ok(usage) => {
                    self.info.observe_memory(&usage.memory);
                    self.io.increase_to(&usage.io);
                    if let Some(message) = quota.check(&usage.memory) {
                        if self.info.monitor_flag {
                            error!(name = %self.metadata.journal_name(), pid = worker.pid, %message, "killing worker");
                            self.log.line(&message);
                            self.terminate(worker).await;
                            return Watch::Killed(message);
                        }
                        if !overage_logged {
                            overage_logged = true;
                            warn!(name = %self.metadata.journal_name(), %message, "memory quota exceeded");
                            self.log.line(format!("{message}; quota not enforced"));
                        }
                    }
                }
                Err(e) => debug!(pid = worker.pid, error = %e, "sampling failed"),
            }

            if !self.log.present() {
                let reason = format!(
                    "{} disappeared; the node was reset or removed",
                    MetadataFile::Log.file_name()
                );
                warn!(name = %self.metadata.journal_name(), pid = worker.pid, "stopping worker: {reason}");
                self.terminate(worker).await;
                return Watch::Aborted(reason);
            }

            if last_heartbeat.elapsed() >= heartbeat {
                last_heartbeat = Instant::now();
                self.metadata.update_journal(MetadataFile::Heartbeat);
                if let Err(e) = self.metadata.write(MetadataFile::JobInfo, &self.info) {
                    debug!(error = %e, "could not refresh job info");
                }
            }
        }
    }

    /// SIGTERM, then SIGKILL after the grace period, then reap.
    async fn terminate(&self, worker: &mut Worker) {
        if let Err(e) = sys::send_signal(worker.pid, Signal::Terminate) {
            debug!(pid = worker.pid, error = %e, "worker already gone");
        }
        if tokio::time::timeout(self.config.kill_grace(), &mut worker.exit)
            .await
            .is_err()
        {
            if let Err(e) = sys::send_signal(worker.pid, Signal::Kill) {
                debug!(pid = worker.pid, error = %e, "worker already gone");
            }
            let _ = (&mut worker.exit).await;
        }
    }

    async fn conclude(&mut self, watch: Watch, worker: Worker) -> MonitorOutcome {
        self.signals.unregister(WORKER_CLEANUP);
        let grace = self.config.kill_grace();
        if let Some(profiler) = worker.profiler {
            profiler.stop(grace).await;
        }
        let channel = match tokio::time::timeout(grace, worker.errors).await {
            Ok(Ok(text)) => text,
            _ => String::new(),
        };

        self.info.wallclock.finish(Utc::now());
        let rusage = RusageInfo::current();
        self.info.rusage = Some(rusage);
        self.info.io = Some(IoStats::from_total(self.io, self.info.wallclock.duration_seconds));

        match watch {
            Watch::Aborted(reason) => MonitorOutcome::Aborted(reason),
            Watch::Killed(reason) => MonitorOutcome::Failed(reason),
            Watch::Exited(status) => self.judge(status, channel.trim(), rusage.children.cpu_seconds()),
        }
    }

    fn judge(&mut self, status: ExitResult, channel: &str, cpu_seconds: f64) -> MonitorOutcome {
        if let Some(message) = channel.strip_prefix(ASSERT_PREFIX) {
            return MonitorOutcome::Assert(message.trim().to_string());
        }
        if !channel.is_empty() {
            return MonitorOutcome::Failed(channel.to_string());
        }
        match status {
            Err(e) => MonitorOutcome::Failed(format!("Failed waiting for worker: {e}")),
            Ok(status) if !status.success() => MonitorOutcome::Failed(describe_exit(status)),
            Ok(_) => {
                let wall = self.info.wallclock.duration_seconds;
                match self.config.thread_quota.check(cpu_seconds, wall, self.info.threads) {
                    Some(message) if self.info.monitor_flag => MonitorOutcome::Failed(message),
                    Some(message) => {
                        warn!(name = %self.metadata.journal_name(), %message, "thread quota exceeded");
                        self.log.line(format!("{message}; quota not enforced"));
                        MonitorOutcome::Complete
                    }
                    None => MonitorOutcome::Complete,
                }
            }
        }
    }

    async fn report(&mut self, outcome: &MonitorOutcome) {
        if matches!(outcome, MonitorOutcome::Aborted(_) | MonitorOutcome::RetrySpawn(_)) {
            info!(name = %self.metadata.journal_name(), ?outcome, "job attempt abandoned");
            return;
        }
        let _section = self.signals.critical_section().await;
        if self.stamped {
            if let Err(e) = self.metadata.write(MetadataFile::JobInfo, &self.info) {
                warn!(error = %e, "could not write final job info");
            }
        }
        let (file, written) = match outcome {
            MonitorOutcome::Complete => {
                self.log.line("Job completed");
                (MetadataFile::Complete, self.metadata.write_time(MetadataFile::Complete))
            }
            MonitorOutcome::Failed(message) => {
                self.log.line(format!("Job failed: {message}"));
                (MetadataFile::Errors, self.metadata.write_raw(MetadataFile::Errors, message))
            }
            MonitorOutcome::Assert(message) => {
                self.log.line(format!("Job asserted: {message}"));
                (MetadataFile::Assert, self.metadata.write_raw(MetadataFile::Assert, message))
            }
            MonitorOutcome::Aborted(_) | MonitorOutcome::RetrySpawn(_) => return,
        };
        match written {
            Ok(()) => self.metadata.update_journal(file),
            Err(e) => warn!(name = %self.metadata.journal_name(), error = %e, "could not report outcome"),
        }
        info!(name = %self.metadata.journal_name(), ?outcome, "job attempt finished");
    }
}
