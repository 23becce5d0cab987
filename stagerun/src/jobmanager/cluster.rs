//! Submits jobs to a cluster scheduler through a command-line interface.

use super::template::{render_template, TemplateParams};
use super::{JobManager, JobRequest, ResourceLimits};
use crate::core::{JobResources, ResourceRequest};
use crate::errors::{ConfigError, JobManagerError};
use crate::jobinfo::JobInfo;
use crate::monitor::MonitorConfig;
use crate::metadata::MetadataFile;
use crate::retry::{with_retry, SubmitRetryConfig};
use crate::signals::SignalRegistry;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, info, warn};

/// How a cluster job mode is driven.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobModeConfig {
    /// Job mode name, recorded in `_jobinfo`.
    pub name: String,
    /// Submission command; receives the rendered script on stdin.
    pub cmd: String,
    /// Arguments of the submission command.
    pub args: Vec<String>,
    /// Submission script template with `__MRO_<KEY>__` placeholders.
    pub template: String,
    /// Shell command that reads job ids on stdin and prints those still
    /// queued or running.
    pub queue_query: Option<String>,
    /// How long a job may be missing from the queue before it is failed.
    pub queue_query_grace_secs: u64,
    /// Extra environment passed to submitted jobs.
    pub env: BTreeMap<String, String>,
    /// The scheduler enforces memory as virtual memory.
    pub mem_is_vmem: bool,
    /// Memory per core on the cluster; inflates thread requests of memory-heavy jobs.
    pub mempercore_gb: Option<u32>,
    /// Maximum outstanding jobs; zero means unlimited.
    pub max_jobs: usize,
    /// Minimum time between submissions.
    pub job_freq_millis: u64,
    /// Value of `__MRO_ACCOUNT__`.
    pub account: Option<String>,
    /// Line rendered into `__MRO_RESOURCES__`; its own `__RESOURCES__` is
    /// replaced by the mapped special resource.
    pub resources_opt: Option<String>,
    /// Special resource name to scheduler resource string (`MRO_JOBRESOURCES`).
    pub job_resources: BTreeMap<String, String>,
    /// Retry policy for the submission command.
    pub submit_retry: SubmitRetryConfig,
    /// Largest thread reservation per job; zero means unbounded.
    pub max_threads_per_job: u32,
    /// Largest memory reservation per job; zero means unbounded.
    pub max_mem_gb_per_job: u32,
    /// Threads for a job that requests zero.
    pub default_threads: u32,
    /// Memory for a job that requests zero.
    pub default_mem_gb: u32,
    /// Variables set to the job's thread reservation.
    pub thread_envs: Vec<String>,
    /// Command prefix that wraps every job, normally the job monitor.
    pub monitor: Vec<String>,
    /// How often a slot holder checks whether its job finished.
    pub slot_poll_millis: u64,
}

impl Default for JobModeConfig {
    fn default() -> Self {
        Self {
            name: "cluster".to_string(),
            cmd: String::new(),
            args: Vec::new(),
            template: String::new(),
            queue_query: None,
            queue_query_grace_secs: 3600,
            env: BTreeMap::new(),
            mem_is_vmem: false,
            mempercore_gb: None,
            max_jobs: 64,
            job_freq_millis: 100,
            account: None,
            resources_opt: None,
            job_resources: BTreeMap::new(),
            submit_retry: SubmitRetryConfig::default(),
            max_threads_per_job: 0,
            max_mem_gb_per_job: 0,
            default_threads: 1,
            default_mem_gb: 4,
            thread_envs: super::local::default_thread_envs(),
            monitor: vec!["stagerun-monitor".to_string()],
            slot_poll_millis: 1000,
        }
    }
}

impl JobModeConfig {
    /// Creates a job mode running `cmd`.
    #[must_use]
    pub fn new(name: impl Into<String>, cmd: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            template: template.into(),
            ..Self::default()
        }
    }

    /// Sets the outstanding-jobs limit.
    #[must_use]
    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    /// Sets the minimum interval between submissions.
    #[must_use]
    pub fn with_job_freq_millis(mut self, millis: u64) -> Self {
        self.job_freq_millis = millis;
        self
    }

    /// Sets the memory per core.
    #[must_use]
    pub fn with_mempercore_gb(mut self, gb: u32) -> Self {
        self.mempercore_gb = Some(gb);
        self
    }

    /// Sets the queue query command.
    #[must_use]
    pub fn with_queue_query(mut self, cmd: impl Into<String>, grace_secs: u64) -> Self {
        self.queue_query = Some(cmd.into());
        self.queue_query_grace_secs = grace_secs;
        self
    }

    /// Sets the submission retry policy.
    #[must_use]
    pub fn with_submit_retry(mut self, retry: SubmitRetryConfig) -> Self {
        self.submit_retry = retry;
        self
    }

    /// Sets the wrapper command.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Vec<String>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Parses an `MRO_JOBRESOURCES` value of the form `name:value;name:value`.
    pub fn parse_job_resources(value: &str) -> Result<BTreeMap<String, String>, ConfigError> {
        value
            .split(';')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                pair.split_once(':')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                    .filter(|(k, _)| !k.is_empty())
                    .ok_or_else(|| {
                        ConfigError::invalid_value("MRO_JOBRESOURCES", format!("bad entry '{pair}'"))
                    })
            })
            .collect()
    }

    fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_threads: self.max_threads_per_job,
            max_mem_gb: self.max_mem_gb_per_job,
            default_threads: self.default_threads.max(1),
            default_mem_gb: self.default_mem_gb.max(1),
        }
    }
}

/// Submits jobs to a cluster scheduler.
///
/// Local-only jobs are delegated to a [`super::LocalJobManager`].
pub struct ClusterJobManager {
    config: Arc<JobModeConfig>,
    slots: Option<Arc<Semaphore>>,
    last_submit: Arc<Mutex<Option<Instant>>>,
    outstanding: Arc<DashMap<String, Option<String>>>,
    local: Arc<dyn JobManager>,
    signals: Arc<SignalRegistry>,
    done: Arc<Notify>,
    monitor_settings: Option<MonitorConfig>,
}

impl std::fmt::Debug for ClusterJobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterJobManager")
            .field("mode", &self.config.name)
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}

impl ClusterJobManager {
    /// Creates a manager; `local` runs jobs marked local-only.
    #[must_use]
    pub fn new(
        config: JobModeConfig,
        local: Arc<dyn JobManager>,
        signals: Arc<SignalRegistry>,
    ) -> Self {
        let slots = (config.max_jobs > 0).then(|| Arc::new(Semaphore::new(config.max_jobs)));
        Self {
            config: Arc::new(config),
            slots,
            last_submit: Arc::new(Mutex::new(None)),
            outstanding: Arc::new(DashMap::new()),
            local,
            signals,
            done: Arc::new(Notify::new()),
            monitor_settings: None,
        }
    }

    /// Hands `settings` to the monitor of every cluster job through `_jobinfo`.
    #[must_use]
    pub fn with_monitor_settings(mut self, settings: MonitorConfig) -> Self {
        self.monitor_settings = Some(settings);
        self
    }

    /// Reservation after applying `mempercore`.
    #[must_use]
    pub fn cluster_resources(&self, mut resources: JobResources) -> JobResources {
        if let Some(per_core) = self.config.mempercore_gb.filter(|g| *g > 0) {
            let needed = resources.mem_gb.div_ceil(per_core);
            resources.threads = resources.threads.max(needed);
        }
        resources
    }

    /// Placeholder values for one job.
    #[must_use]
    pub fn template_params(&self, job: &JobRequest, resources: &JobResources) -> TemplateParams {
        let mem_gb = u64::from(resources.mem_gb);
        let threads = u64::from(resources.threads.max(1));
        let per_thread = match self.config.mempercore_gb.filter(|g| *g > 0) {
            Some(per_core) => u64::from(per_core),
            None => mem_gb.div_ceil(threads),
        };
        let mapped = resources
            .special
            .as_ref()
            .and_then(|s| self.config.job_resources.get(s))
            .zip(self.config.resources_opt.as_ref())
            .map(|(value, opt)| opt.replacen("__RESOURCES__", value, 1))
            .unwrap_or_default();

        let mut argv: Vec<String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .chain(
                self.config
                    .thread_envs
                    .iter()
                    .map(|k| format!("{k}={}", resources.threads)),
            )
            .collect();
        argv.extend(self.config.monitor.iter().cloned());
        argv.extend(job.worker_argv());

        let mut params = TemplateParams::new();
        let mut set = |k: &str, v: String| {
            params.insert(k.to_string(), v);
        };
        set("JOB_NAME", job.job_name());
        set("THREADS", resources.threads.to_string());
        set("STDOUT", job.metadata.metadata_file_path(MetadataFile::Stdout).display().to_string());
        set("STDERR", job.metadata.metadata_file_path(MetadataFile::Stderr).display().to_string());
        set("JOB_WORKDIR", job.metadata.files_path().display().to_string());
        set("CMD", argv.join(" "));
        set("MEM_GB", mem_gb.to_string());
        set("MEM_MB", (mem_gb * 1024).to_string());
        set("MEM_KB", (mem_gb * 1024 * 1024).to_string());
        set("MEM_B", (mem_gb * 1024 * 1024 * 1024).to_string());
        set("MEM_GB_PER_THREAD", per_thread.to_string());
        set("MEM_MB_PER_THREAD", (per_thread * 1024).to_string());
        set("ACCOUNT", self.config.account.clone().unwrap_or_default());
        set("RESOURCES", mapped);
        params
    }
}

#[async_trait]
impl JobManager for ClusterJobManager {
    fn resources(
        &self,
        request: &ResourceRequest,
        local: bool,
    ) -> Result<JobResources, JobManagerError> {
        if local {
            return self.local.resources(request, true);
        }
        let resources = self.config.limits().normalise(request)?;
        Ok(self.cluster_resources(resources))
    }

    fn can_submit(&self, resources: &JobResources, local: bool) -> bool {
        if local {
            return self.local.can_submit(resources, true);
        }
        self.slots
            .as_ref()
            .map_or(true, |s| s.available_permits() > 0)
    }

    fn submit(&self, job: JobRequest) -> Result<(), JobManagerError> {
        if job.local {
            return self.local.submit(job);
        }
        let resources = self.resources(&job.resources, false)?;
        let mut info = JobInfo::new(job.fqname.clone(), self.config.name.clone()).with_resources(
            resources.threads,
            resources.mem_gb,
            resources.vmem_gb,
        );
        if self.config.mem_is_vmem {
            info.vmem_gb = info.vmem_gb.max(info.mem_gb);
        }
        if let Some(settings) = &self.monitor_settings {
            info = info.with_monitor_settings(settings);
        }
        job.metadata.write(MetadataFile::JobInfo, &info)?;
        job.metadata.update_journal(MetadataFile::JobInfo);

        let script = render_template(&self.config.template, &self.template_params(&job, &resources));
        let submission = Submission {
            config: Arc::clone(&self.config),
            job,
            script,
        };
        let slots = self.slots.clone();
        let last_submit = Arc::clone(&self.last_submit);
        let outstanding = Arc::clone(&self.outstanding);
        let signals = Arc::clone(&self.signals);
        let done = Arc::clone(&self.done);
        tokio::spawn(async move {
            submission.run(slots, last_submit, outstanding, signals).await;
            done.notify_one();
        });
        Ok(())
    }

    fn max_cores(&self) -> u32 {
        self.config.max_threads_per_job
    }

    fn max_mem_gb(&self) -> u32 {
        self.config.max_mem_gb_per_job
    }

    fn refresh_resources(&self) {
        self.local.refresh_resources();
    }

    fn done(&self) -> Arc<Notify> {
        Arc::clone(&self.done)
    }

    async fn check_queue(&self) -> Vec<String> {
        let Some(query) = self.config.queue_query.as_deref() else {
            return Vec::new();
        };
        let ids: Vec<(String, String)> = self
            .outstanding
            .iter()
            .filter_map(|e| e.value().clone().map(|id| (e.key().clone(), id)))
            .collect();
        if ids.is_empty() {
            return Vec::new();
        }
        let input = ids.iter().map(|(_, id)| id.as_str()).collect::<Vec<_>>().join("\n");
        let args = ["-c".to_string(), query.to_string()];
        let output = match run_with_stdin("/bin/sh", &args, &input, None).await {
            Ok(out) if out.success => out.stdout,
            Ok(out) => {
                warn!(query, stderr = %out.stderr, "queue query failed");
                return Vec::new();
            }
            Err(e) => {
                warn!(query, error = %e, "queue query failed");
                return Vec::new();
            }
        };
        let present: HashSet<&str> = output.lines().map(str::trim).collect();
        ids.into_iter()
            .filter(|(_, id)| !present.contains(id.as_str()))
            .map(|(name, _)| name)
            .collect()
    }

    fn queue_check_grace(&self) -> Option<Duration> {
        self.config
            .queue_query
            .as_ref()
            .map(|_| Duration::from_secs(self.config.queue_query_grace_secs))
    }

    fn is_local(&self) -> bool {
        false
    }
}

struct Submission {
    config: Arc<JobModeConfig>,
    job: JobRequest,
    script: String,
}

impl Submission {
    async fn run(
        self,
        slots: Option<Arc<Semaphore>>,
        last_submit: Arc<Mutex<Option<Instant>>>,
        outstanding: Arc<DashMap<String, Option<String>>>,
        signals: Arc<SignalRegistry>,
    ) {
        let _slot = match slots {
            Some(s) => match s.acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            None => None,
        };
        self.wait_rate_limit(&last_submit).await;
        if signals.is_shutting_down() {
            return;
        }

        let meta = &self.job.metadata;
        let key = meta.journal_name().to_string();
        if let Err(e) = meta.write_raw(MetadataFile::JobScript, &self.script) {
            warn!(fqname = %self.job.fqname, error = %e, "could not save job script");
        }
        outstanding.insert(key.clone(), None);

        let workdir = meta.files_path();
        let config = &self.config;
        let script = &self.script;
        let result = with_retry(
            &config.submit_retry,
            &self.job.fqname,
            || {
                let workdir = workdir.clone();
                async move {
                    let out = run_with_stdin(&config.cmd, &config.args, script, Some(&workdir))
                        .await
                        .map_err(|e| SubmitFailure {
                            message: e.to_string(),
                            output: String::new(),
                        })?;
                    if out.success {
                        Ok(out.stdout)
                    } else {
                        Err(SubmitFailure {
                            message: out.status,
                            output: format!("{}{}", out.stdout, out.stderr),
                        })
                    }
                }
            },
            |_| true,
        )
        .await;

        match result {
            Ok(stdout) => {
                let trimmed = stdout.trim();
                if !trimmed.is_empty() && !trimmed.contains(char::is_whitespace) {
                    if meta.write_raw(MetadataFile::JobId, trimmed).is_ok() {
                        meta.update_journal(MetadataFile::JobId);
                    }
                    if let Some(mut entry) = outstanding.get_mut(&key) {
                        *entry = Some(trimmed.to_string());
                    }
                }
                info!(fqname = %self.job.fqname, job_id = trimmed, "job submitted");
            }
            Err((failure, attempts)) => {
                let err = JobManagerError::Submission {
                    attempts,
                    message: failure.message,
                    output: failure.output,
                };
                warn!(fqname = %self.job.fqname, error = %err, "job submission failed");
                if meta.write_raw(MetadataFile::Errors, &err.to_string()).is_ok() {
                    meta.update_journal(MetadataFile::Errors);
                }
                outstanding.remove(&key);
                return;
            }
        }

        let poll = Duration::from_millis(self.config.slot_poll_millis.max(10));
        loop {
            if meta.exists(MetadataFile::Complete)
                || meta.exists(MetadataFile::Errors)
                || meta.exists(MetadataFile::Assert)
                || !meta.path().exists()
                || signals.is_shutting_down()
            {
                break;
            }
            tokio::time::sleep(poll).await;
        }
        outstanding.remove(&key);
        debug!(fqname = %self.job.fqname, "cluster slot released");
    }

    async fn wait_rate_limit(&self, last_submit: &Mutex<Option<Instant>>) {
        let min_gap = Duration::from_millis(self.config.job_freq_millis);
        let mut last = last_submit.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < min_gap {
                tokio::time::sleep(min_gap - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

struct SubmitFailure {
    message: String,
    output: String,
}

impl std::fmt::Display for SubmitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

struct CommandOutput {
    success: bool,
    status: String,
    stdout: String,
    stderr: String,
}

async fn run_with_stdin(
    program: &str,
    args: &[String],
    input: &str,
    workdir: Option<&std::path::Path>,
) -> std::io::Result<CommandOutput> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = workdir {
        command.current_dir(dir);
    }
    let mut child = command.spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).await?;
    }
    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        success: output.status.success(),
        status: output.status.to_string(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobinfo::ProfileMode;
    use crate::jobmanager::{JobMode, LocalConfig, LocalJobManager};
    use crate::metadata::{Journal, Metadata};
    use crate::retry::JitterStrategy;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn local(signals: &Arc<SignalRegistry>) -> Arc<dyn JobManager> {
        Arc::new(LocalJobManager::new(
            LocalConfig::new().with_max_cores(2).with_max_mem_gb(2).with_monitor(Vec::new()),
            Arc::clone(signals),
        ))
    }

    fn manager(config: JobModeConfig) -> ClusterJobManager {
        let signals = Arc::new(SignalRegistry::default());
        ClusterJobManager::new(config, local(&signals), signals)
    }

    fn job(dir: &TempDir, name: &str, resources: ResourceRequest) -> JobRequest {
        let journal = Arc::new(Journal::new(dir.path().join("journal")));
        journal.ensure_dir().unwrap();
        let meta = Metadata::new(name, name, dir.path().join(name), journal);
        meta.mkdirs().unwrap();
        JobRequest::new(name, JobMode::Main, meta, vec!["/opt/stage".into()], resources)
    }

    fn fast_retry(attempts: usize) -> SubmitRetryConfig {
        SubmitRetryConfig::new()
            .with_max_attempts(attempts)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None)
    }

    async fn wait_for(meta: &Metadata, file: MetadataFile) {
        for _ in 0..200 {
            if meta.exists(file) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("{file} never appeared");
    }

    #[test]
    fn test_mempercore_inflates_threads() {
        let jm = manager(JobModeConfig::default().with_mempercore_gb(4));
        let res = jm.resources(&ResourceRequest::new(1, 30), false).unwrap();
        assert_eq!(res.threads, 8);
        let res = jm.resources(&ResourceRequest::new(16, 8), false).unwrap();
        assert_eq!(res.threads, 16);
    }

    #[test]
    fn test_template_params() {
        let dir = TempDir::new().unwrap();
        let mut config = JobModeConfig::default();
        config.monitor = vec!["mon".into()];
        config.thread_envs = vec!["MRO_THREADS".into()];
        config.resources_opt = Some("#$ -l __RESOURCES__".into());
        config.job_resources = JobModeConfig::parse_job_resources("gpu:ngpus=1").unwrap();
        let jm = manager(config);
        let j = job(&dir, "S", ResourceRequest::new(2, 5).with_special("gpu"));
        let res = jm.resources(&j.resources, false).unwrap();
        let params = jm.template_params(&j, &res);
        assert_eq!(params["THREADS"], "2");
        assert_eq!(params["MEM_MB"], "5120");
        assert_eq!(params["MEM_GB_PER_THREAD"], "3");
        assert_eq!(params["RESOURCES"], "#$ -l ngpus=1");
        assert_eq!(params["ACCOUNT"], "");
        assert!(params["CMD"].starts_with("MRO_THREADS=2 mon /opt/stage main "));
        assert_eq!(params["JOB_NAME"], "S.main");
    }

    #[test]
    fn test_parse_job_resources() {
        let map = JobModeConfig::parse_job_resources("gpu:ngpus=1; big : mem=1T;").unwrap();
        assert_eq!(map["gpu"], "ngpus=1");
        assert_eq!(map["big"], "mem=1T");
        assert!(JobModeConfig::parse_job_resources("nocolon").is_err());
    }

    #[tokio::test]
    async fn test_submit_writes_script_and_jobid() {
        let dir = TempDir::new().unwrap();
        let mut config = JobModeConfig::new("sge", "/bin/sh", "#!/bin/sh\n#$ -N __MRO_JOB_NAME__\n#$ -A __MRO_ACCOUNT__\n__MRO_CMD__\n")
            .with_job_freq_millis(0)
            .with_submit_retry(fast_retry(2));
        config.args = vec!["-c".into(), "cat > script.txt; echo 4242".into()];
        let jm = manager(config);
        let j = job(&dir, "S", ResourceRequest::new(1, 1));
        let meta = j.metadata.clone();
        jm.submit(j).unwrap();
        wait_for(&meta, MetadataFile::JobId).await;
        assert_eq!(meta.read_raw(MetadataFile::JobId).unwrap(), "4242");
        let script = meta.read_raw(MetadataFile::JobScript).unwrap();
        assert!(script.contains("#$ -N S.main"));
        assert!(!script.contains("-A"));
        let info: JobInfo = meta.read_into(MetadataFile::JobInfo).unwrap();
        assert_eq!(info.job_type, "sge");
        assert!(!info.monitor_flag);
        std::fs::write(meta.metadata_file_path(MetadataFile::Complete), "").unwrap();
    }

    #[tokio::test]
    async fn test_submit_carries_monitor_settings() {
        let dir = TempDir::new().unwrap();
        let mut config = JobModeConfig::new("sge", "/bin/sh", "__MRO_CMD__\n")
            .with_job_freq_millis(0)
            .with_submit_retry(fast_retry(1));
        config.args = vec!["-c".into(), "cat > /dev/null; echo 7".into()];
        let settings = MonitorConfig::default()
            .with_enforce(true)
            .with_profile_mode(ProfileMode::Cpu);
        let jm = manager(config).with_monitor_settings(settings.clone());
        let j = job(&dir, "S", ResourceRequest::new(1, 1));
        let meta = j.metadata.clone();
        jm.submit(j).unwrap();

        let info: JobInfo = meta.read_into(MetadataFile::JobInfo).unwrap();
        assert!(info.monitor_flag);
        assert_eq!(info.profile_mode, ProfileMode::Cpu);
        assert_eq!(info.monitor, Some(settings));
        wait_for(&meta, MetadataFile::JobId).await;
        std::fs::write(meta.metadata_file_path(MetadataFile::Complete), "").unwrap();
    }

    #[tokio::test]
    async fn test_submission_failure_after_retries() {
        let dir = TempDir::new().unwrap();
        let mut config = JobModeConfig::new("sge", "/bin/sh", "__MRO_CMD__\n")
            .with_job_freq_millis(0)
            .with_submit_retry(fast_retry(3));
        config.args = vec!["-c".into(), "echo queue full; exit 1".into()];
        let jm = manager(config);
        let j = job(&dir, "S", ResourceRequest::new(1, 1));
        let meta = j.metadata.clone();
        jm.submit(j).unwrap();
        wait_for(&meta, MetadataFile::Errors).await;
        let text = meta.read_raw(MetadataFile::Errors).unwrap();
        assert!(text.starts_with("jobcmd error ("));
        assert!(text.contains("after 3 attempt(s)"));
        assert!(text.contains("queue full"));
    }

    #[tokio::test]
    async fn test_max_jobs_gates_submission() {
        let dir = TempDir::new().unwrap();
        let mut config = JobModeConfig::new("sge", "/bin/sh", "__MRO_CMD__\n")
            .with_max_jobs(1)
            .with_job_freq_millis(0);
        config.args = vec!["-c".into(), "cat > /dev/null; echo 1".into()];
        config.slot_poll_millis = 10;
        let jm = manager(config);
        let res = jm.resources(&ResourceRequest::new(1, 1), false).unwrap();
        assert!(jm.can_submit(&res, false));

        let a = job(&dir, "A", ResourceRequest::new(1, 1));
        let b = job(&dir, "B", ResourceRequest::new(1, 1));
        let (ma, mb) = (a.metadata.clone(), b.metadata.clone());
        jm.submit(a).unwrap();
        wait_for(&ma, MetadataFile::JobId).await;
        assert!(!jm.can_submit(&res, false));

        jm.submit(b).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!mb.exists(MetadataFile::JobScript));

        std::fs::write(ma.metadata_file_path(MetadataFile::Complete), "").unwrap();
        wait_for(&mb, MetadataFile::JobId).await;
        std::fs::write(mb.metadata_file_path(MetadataFile::Complete), "").unwrap();
    }

    #[tokio::test]
    async fn test_check_queue_reports_missing_jobs() {
        let dir = TempDir::new().unwrap();
        let mut config = JobModeConfig::new("sge", "/bin/sh", "__MRO_CMD__\n")
            .with_job_freq_millis(0)
            .with_queue_query("grep -x 999 || true", 60);
        config.args = vec!["-c".into(), "cat > /dev/null; echo 11".into()];
        let jm = manager(config);
        assert_eq!(jm.queue_check_grace(), Some(Duration::from_secs(60)));
        assert!(jm.check_queue().await.is_empty());

        let j = job(&dir, "S", ResourceRequest::new(1, 1));
        let meta = j.metadata.clone();
        jm.submit(j).unwrap();
        wait_for(&meta, MetadataFile::JobId).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(jm.check_queue().await, vec!["S".to_string()]);
        std::fs::write(meta.metadata_file_path(MetadataFile::Complete), "").unwrap();
    }
}
