//! A job manager that plays back scripted job outcomes.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::core::{JobResources, ResourceRequest};
use crate::errors::JobManagerError;
use crate::jobinfo::JobInfo;
use crate::jobmanager::{JobManager, JobMode, JobRequest, ResourceLimits};
use crate::metadata::{timestamp, Metadata, MetadataFile};
use crate::node::StageDefs;

/// What a scripted job does when submitted.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Finishes with these outputs.
    Complete(Value),
    /// Finishes with this literal `_outs` text.
    CompleteRaw(String),
    /// A split that emits these chunk definitions.
    Split(StageDefs),
    /// Fails with this `_errors` text.
    Fail(String),
    /// Fails with this `_assert` text.
    Assert(String),
    /// Starts running and never finishes.
    Hang,
    /// Stays queued and never starts.
    Queue,
}

/// A submitted job as the scripted manager saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    /// Stage name.
    pub fqname: String,
    /// Phase.
    pub mode: JobMode,
    /// Journal name of the job metadata.
    pub job: String,
}

/// Writes scripted outcomes straight into job metadata on submit.
///
/// Outcomes are queued per stage and phase; once a queue runs dry the job
/// completes with empty outputs (or a one-chunk split).
pub struct ScriptedJobManager {
    outcomes: Mutex<HashMap<(String, JobMode), VecDeque<Outcome>>>,
    submitted: Mutex<Vec<Submitted>>,
    limits: ResourceLimits,
    capacity: Mutex<Option<usize>>,
    done: Arc<Notify>,
}

impl std::fmt::Debug for ScriptedJobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedJobManager")
            .field("submitted", &self.submitted.lock().len())
            .finish()
    }
}

impl Default for ScriptedJobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedJobManager {
    /// Creates a manager where every job succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            limits: ResourceLimits {
                max_threads: 16,
                max_mem_gb: 64,
                default_threads: 1,
                default_mem_gb: 1,
            },
            capacity: Mutex::new(None),
            done: Arc::new(Notify::new()),
        }
    }

    /// Queues an outcome for the next `mode` job of `fqname`.
    pub fn script(&self, fqname: &str, mode: JobMode, outcome: Outcome) {
        self.outcomes
            .lock()
            .entry((fqname.to_string(), mode))
            .or_default()
            .push_back(outcome);
    }

    /// Builder form of [`ScriptedJobManager::script`].
    #[must_use]
    pub fn with(self, fqname: &str, mode: JobMode, outcome: Outcome) -> Self {
        self.script(fqname, mode, outcome);
        self
    }

    /// Accept at most `jobs` more submissions.
    pub fn set_capacity(&self, jobs: Option<usize>) {
        *self.capacity.lock() = jobs;
    }

    /// Every job submitted so far.
    #[must_use]
    pub fn submitted(&self) -> Vec<Submitted> {
        self.submitted.lock().clone()
    }

    /// Number of jobs submitted for `fqname` in `mode`.
    #[must_use]
    pub fn count(&self, fqname: &str, mode: JobMode) -> usize {
        self.submitted
            .lock()
            .iter()
            .filter(|s| s.fqname == fqname && s.mode == mode)
            .count()
    }

    fn next_outcome(&self, fqname: &str, mode: JobMode) -> Outcome {
        let scripted = self
            .outcomes
            .lock()
            .get_mut(&(fqname.to_string(), mode))
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| match mode {
            JobMode::Split => Outcome::Split(StageDefs {
                chunks: vec![Default::default()],
                join: None,
            }),
            JobMode::Main | JobMode::Join => Outcome::Complete(Value::Object(Default::default())),
        })
    }
}

fn play(meta: &Metadata, outcome: &Outcome) -> Result<(), JobManagerError> {
    if matches!(outcome, Outcome::Queue) {
        return Ok(());
    }
    meta.append(MetadataFile::Log, &format!("{} [monitor] scripted job started\n", timestamp()))?;
    meta.update_journal(MetadataFile::Log);
    match outcome {
        Outcome::Complete(outs) => {
            meta.write(MetadataFile::Outs, outs)?;
            meta.write_time(MetadataFile::Complete)?;
            meta.update_journal(MetadataFile::Complete);
        }
        Outcome::CompleteRaw(text) => {
            meta.write_raw(MetadataFile::Outs, text)?;
            meta.write_time(MetadataFile::Complete)?;
            meta.update_journal(MetadataFile::Complete);
        }
        Outcome::Split(defs) => {
            meta.write(MetadataFile::StageDefs, defs)?;
            meta.write_time(MetadataFile::Complete)?;
            meta.update_journal(MetadataFile::Complete);
        }
        Outcome::Fail(text) => {
            meta.write_raw(MetadataFile::Errors, text)?;
            meta.update_journal(MetadataFile::Errors);
        }
        Outcome::Assert(text) => {
            meta.write_raw(MetadataFile::Assert, text)?;
            meta.update_journal(MetadataFile::Assert);
        }
        Outcome::Hang | Outcome::Queue => {}
    }
    Ok(())
}

#[async_trait]
impl JobManager for ScriptedJobManager {
    fn resources(
        &self,
        request: &ResourceRequest,
        _local: bool,
    ) -> Result<JobResources, JobManagerError> {
        Ok(self.limits.normalise(request)?)
    }

    fn can_submit(&self, _resources: &JobResources, _local: bool) -> bool {
        self.capacity.lock().map_or(true, |c| c > 0)
    }

    fn submit(&self, job: JobRequest) -> Result<(), JobManagerError> {
        if let Some(c) = self.capacity.lock().as_mut() {
            *c = c.saturating_sub(1);
        }
        let resources = self.limits.normalise(&job.resources)?;
        let info = JobInfo::new(job.fqname.clone(), "scripted").with_resources(
            resources.threads,
            resources.mem_gb,
            resources.vmem_gb,
        );
        job.metadata.mkdirs()?;
        job.metadata.write(MetadataFile::JobInfo, &info)?;
        job.metadata.update_journal(MetadataFile::JobInfo);

        let outcome = self.next_outcome(&job.fqname, job.mode);
        play(&job.metadata, &outcome)?;
        self.submitted.lock().push(Submitted {
            fqname: job.fqname,
            mode: job.mode,
            job: job.metadata.journal_name().to_string(),
        });
        self.done.notify_one();
        Ok(())
    }

    fn max_cores(&self) -> u32 {
        self.limits.max_threads
    }

    fn max_mem_gb(&self) -> u32 {
        self.limits.max_mem_gb
    }

    fn done(&self) -> Arc<Notify> {
        Arc::clone(&self.done)
    }

    fn is_local(&self) -> bool {
        true
    }
}
