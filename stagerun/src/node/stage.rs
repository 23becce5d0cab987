//! Runtime state of one node and the split/chunk/join machine of stages.

use super::graph::NodeSpec;
use crate::core::{JobState, MetadataState, NodeKind, ResourceRequest};
use crate::errors::MetadataError;
use crate::jobinfo::JobInfo;
use crate::jobmanager::{JobManager, JobMode, JobRequest};
use crate::metadata::{Journal, Metadata, MetadataFile};
use crate::retry::FailureReport;
use crate::sys;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Argument or output map of a node.
pub type Args = Map<String, Value>;

const LOG_TAIL_LINES: usize = 20;
const MAX_LOCAL_TRANSITIONS: usize = 6;

/// One chunk emitted by a split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkDef {
    /// Resources of the chunk job; all zero inherits the stage's request.
    pub resources: ResourceRequest,
    /// Arguments layered over the stage arguments.
    pub args: Args,
}

/// Contents of `_stage_defs`, the output of a split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageDefs {
    /// Chunks to run.
    pub chunks: Vec<ChunkDef>,
    /// Resources of the join job.
    pub join: Option<ResourceRequest>,
}

/// Directory of a node under the run root.
#[must_use]
pub fn node_dir(root: &Path, fqname: &str) -> PathBuf {
    fqname.split('.').fold(root.to_path_buf(), |dir, part| dir.join(part))
}

fn chunk_dir(index: usize) -> String {
    format!("chnk{index}")
}

/// A node of the expanded graph together with its metadata.
///
/// A stage owns four kinds of metadata: the node's own (args, outs,
/// completion), `split/`, one `chnk<i>/` per chunk, and `join/`. Stages
/// without a split get a synthetic one-chunk split so every stage follows
/// the same path.
#[derive(Debug)]
pub struct Node {
    spec: NodeSpec,
    metadata: Metadata,
    split: Metadata,
    join: Metadata,
    chunks: Vec<Metadata>,
    stage_defs: Option<StageDefs>,
    outs: Option<Args>,
    state: JobState,
    last_heartbeat: HashMap<String, SystemTime>,
    not_running_since: HashMap<String, SystemTime>,
}

impl Node {
    /// Creates the runtime node; nothing is touched on disk.
    #[must_use]
    pub fn new(spec: NodeSpec, root: &Path, journal: Arc<Journal>) -> Self {
        let metadata = Metadata::new(
            spec.fqname.clone(),
            spec.fqname.clone(),
            node_dir(root, &spec.fqname),
            journal,
        );
        Self {
            split: metadata.child("split"),
            join: metadata.child("join"),
            metadata,
            spec,
            chunks: Vec::new(),
            stage_defs: None,
            outs: None,
            state: JobState::Waiting,
            last_heartbeat: HashMap::new(),
            not_running_since: HashMap::new(),
        }
    }

    /// The call-graph declaration.
    #[must_use]
    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    /// Fully-qualified name.
    #[must_use]
    pub fn fqname(&self) -> &str {
        &self.spec.fqname
    }

    /// Stage or pipeline.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.spec.kind
    }

    /// State computed at the last update.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: JobState) {
        self.state = state;
    }

    /// The node's own metadata.
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Chunk metadata, once the split finished.
    #[must_use]
    pub fn chunks(&self) -> &[Metadata] {
        &self.chunks
    }

    /// Published outputs, once complete.
    #[must_use]
    pub fn outs(&self) -> Option<&Args> {
        self.outs.as_ref()
    }

    /// Journal names of every metadata this node owns.
    #[must_use]
    pub fn journal_names(&self) -> Vec<String> {
        self.all_metadata()
            .map(|m| m.journal_name().to_string())
            .collect()
    }

    /// Whether a journal name refers to this node or one of its phases.
    #[must_use]
    pub fn owns_journal_name(&self, name: &str) -> bool {
        if name == self.fqname() {
            return true;
        }
        let Some(suffix) = name
            .strip_prefix(self.fqname())
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            return false;
        };
        suffix == "split"
            || suffix == "join"
            || suffix
                .strip_prefix("chnk")
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    }

    fn all_metadata(&self) -> impl Iterator<Item = &Metadata> {
        std::iter::once(&self.metadata)
            .chain(std::iter::once(&self.split))
            .chain(self.chunks.iter())
            .chain(std::iter::once(&self.join))
    }

    fn job_metadata(&self) -> impl Iterator<Item = &Metadata> {
        std::iter::once(&self.split)
            .chain(self.chunks.iter())
            .chain(std::iter::once(&self.join))
    }

    /// Re-reads every metadata directory and seeds heartbeats to `now`.
    pub fn load(&mut self, now: SystemTime) -> Result<(), MetadataError> {
        self.refresh()?;
        for name in self.journal_names() {
            self.last_heartbeat.insert(name, now);
        }
        Ok(())
    }

    /// Re-reads which metadata files exist.
    pub fn refresh(&mut self) -> Result<(), MetadataError> {
        self.metadata.refresh()?;
        self.split.refresh()?;
        self.join.refresh()?;
        if !self.split.has(MetadataFile::Complete) {
            self.stage_defs = None;
            self.chunks.clear();
        }
        if !self.metadata.has(MetadataFile::Complete) {
            self.outs = None;
        }
        if self.stage_defs.is_none() && self.split.has(MetadataFile::Complete) {
            match self.split.read_into::<StageDefs>(MetadataFile::StageDefs) {
                Ok(defs) => self.set_stage_defs(defs),
                Err(e) => {
                    let message = format!("Split did not produce valid stage definitions: {e}");
                    record_failure(&mut self.split, &message);
                }
            }
        }
        for chunk in &mut self.chunks {
            chunk.refresh()?;
        }
        if self.outs.is_none() && self.metadata.has(MetadataFile::Complete) {
            self.outs = match self.metadata.read_into::<Args>(MetadataFile::Outs) {
                Ok(outs) => Some(outs),
                Err(e) if e.is_not_found() => Some(Args::new()),
                Err(e) => {
                    warn!(fqname = %self.spec.fqname, error = %e, "could not read outputs");
                    Some(Args::new())
                }
            };
        }
        Ok(())
    }

    fn set_stage_defs(&mut self, defs: StageDefs) {
        self.chunks = (0..defs.chunks.len())
            .map(|i| self.metadata.child(&chunk_dir(i)))
            .collect();
        self.stage_defs = Some(defs);
    }

    /// Derives the state of a stage from its metadata.
    ///
    /// `ready` says whether every prerequisite is satisfied.
    #[must_use]
    pub fn derive_stage_state(&self, ready: bool) -> JobState {
        if self.spec.modifiers.disabled || self.metadata.has(MetadataFile::Disabled) {
            return JobState::Disabled;
        }
        match self.metadata.state() {
            MetadataState::Failed => return JobState::Failed,
            MetadataState::Complete => return JobState::Complete,
            _ => {}
        }
        match self.join.state() {
            MetadataState::Failed => return JobState::Failed,
            MetadataState::Queued | MetadataState::Running => return JobState::JoinRunning,
            MetadataState::Complete => return JobState::JoinComplete,
            _ => {}
        }
        if self.stage_defs.is_some() {
            let states: Vec<MetadataState> = self.chunks.iter().map(Metadata::state).collect();
            if states.contains(&MetadataState::Failed) {
                return JobState::Failed;
            }
            if states.iter().all(|s| *s == MetadataState::Complete) {
                return JobState::ChunksComplete;
            }
            let started = states
                .iter()
                .any(|s| matches!(s, MetadataState::Queued | MetadataState::Running | MetadataState::Complete));
            if self.spec.split {
                return if started {
                    JobState::ChunksRunning
                } else {
                    JobState::SplitComplete
                };
            }
            return if states.contains(&MetadataState::Running) {
                JobState::Running
            } else if started {
                JobState::Queued
            } else {
                JobState::Ready
            };
        }
        match self.split.state() {
            MetadataState::Failed => JobState::Failed,
            MetadataState::Queued => JobState::Queued,
            MetadataState::Running => JobState::SplitRunning,
            MetadataState::Complete => JobState::SplitComplete,
            _ if ready => JobState::Ready,
            _ => JobState::Waiting,
        }
    }

    /// Derives the state of a pipeline from the aggregate of its children.
    #[must_use]
    pub fn derive_pipeline_state(&self, children: JobState) -> JobState {
        if self.spec.modifiers.disabled || self.metadata.has(MetadataFile::Disabled) {
            return JobState::Disabled;
        }
        match self.metadata.state() {
            MetadataState::Failed => JobState::Failed,
            MetadataState::Complete => JobState::Complete,
            _ if children == JobState::Complete => JobState::JoinComplete,
            _ => children,
        }
    }

    /// Advances a stage as far as it can go without waiting on a job.
    ///
    /// Returns the number of jobs submitted.
    pub fn step(&mut self, args: &Args, jm: &dyn JobManager) -> Result<usize, MetadataError> {
        let mut submitted = 0;
        let mut state = self.state;
        for _ in 0..MAX_LOCAL_TRANSITIONS {
            match state {
                JobState::Ready if self.stage_defs.is_none() => {
                    submitted += self.start_split(args, jm)?;
                }
                JobState::Ready | JobState::SplitComplete | JobState::ChunksRunning => {
                    submitted += self.submit_chunks(args, jm)?;
                }
                JobState::ChunksComplete => submitted += self.start_join(args, jm)?,
                JobState::JoinComplete => self.finish()?,
                _ => break,
            }
            let next = self.derive_stage_state(true);
            if next == state {
                break;
            }
            debug!(fqname = %self.spec.fqname, from = %state, to = %next, "stage advanced");
            state = next;
        }
        Ok(submitted)
    }

    fn start_split(&mut self, args: &Args, jm: &dyn JobManager) -> Result<usize, MetadataError> {
        self.split.mkdirs()?;
        self.metadata.write(MetadataFile::Args, args)?;
        self.metadata.note_written(MetadataFile::Args);
        self.split.write(MetadataFile::Args, args)?;
        self.split.note_written(MetadataFile::Args);

        if !self.spec.split {
            let defs = StageDefs {
                chunks: vec![ChunkDef {
                    resources: self.spec.resources.clone(),
                    args: Args::new(),
                }],
                join: None,
            };
            self.split.write(MetadataFile::StageDefs, &defs)?;
            self.split.write_time(MetadataFile::Complete)?;
            self.split.note_written(MetadataFile::StageDefs);
            self.split.note_written(MetadataFile::Complete);
            self.split.update_journal(MetadataFile::Complete);
            self.set_stage_defs(defs);
            return self.submit_chunks(args, jm);
        }
        let submitted = submit_job(
            &self.spec,
            &mut self.split,
            JobMode::Split,
            ResourceRequest::default(),
            jm,
        );
        Ok(usize::from(submitted))
    }

    fn submit_chunks(&mut self, args: &Args, jm: &dyn JobManager) -> Result<usize, MetadataError> {
        let Some(defs) = self.stage_defs.as_ref() else {
            return Ok(0);
        };
        let mut submitted = 0;
        for (chunk, def) in self.chunks.iter_mut().zip(&defs.chunks) {
            if chunk.state() != MetadataState::Waiting {
                continue;
            }
            if !chunk.has(MetadataFile::Args) {
                chunk.mkdirs()?;
                let mut chunk_args = args.clone();
                chunk_args.extend(def.args.clone());
                chunk.write(MetadataFile::Args, &chunk_args)?;
                chunk.note_written(MetadataFile::Args);
            }
            let request = if def.resources == ResourceRequest::default() {
                self.spec.resources.clone()
            } else {
                def.resources.clone()
            };
            if submit_job(&self.spec, chunk, JobMode::Main, request, jm) {
                submitted += 1;
            } else if chunk.state() == MetadataState::Waiting {
                break;
            }
        }
        Ok(submitted)
    }

    fn start_join(&mut self, args: &Args, jm: &dyn JobManager) -> Result<usize, MetadataError> {
        let defs = self.stage_defs.clone().unwrap_or_default();
        let mut outs: Vec<Value> = Vec::with_capacity(self.chunks.len());
        for chunk in &mut self.chunks {
            match chunk.read_into::<Value>(MetadataFile::Outs) {
                Ok(value) => outs.push(value),
                Err(e) if e.is_not_found() => outs.push(Value::Null),
                Err(e) => {
                    warn!(fqname = %self.spec.fqname, job = chunk.journal_name(), error = %e, "chunk outputs unreadable");
                    record_failure(chunk, &format!("Chunk outputs could not be read: {e}"));
                    return Ok(0);
                }
            }
        }

        self.join.mkdirs()?;
        self.join.write(MetadataFile::Args, args)?;
        self.join.write(MetadataFile::ChunkDefs, &defs.chunks)?;
        self.join.write(MetadataFile::ChunkOuts, &outs)?;
        for file in [MetadataFile::Args, MetadataFile::ChunkDefs, MetadataFile::ChunkOuts] {
            self.join.note_written(file);
        }

        if self.spec.split && self.spec.join {
            let request = defs.join.unwrap_or_default();
            let submitted = submit_job(&self.spec, &mut self.join, JobMode::Join, request, jm);
            return Ok(usize::from(submitted));
        }
        let merged = if self.spec.split {
            Value::Object(merge_chunk_outs(&outs))
        } else {
            outs.into_iter()
                .next()
                .filter(Value::is_object)
                .unwrap_or_else(|| Value::Object(Args::new()))
        };
        self.join.write(MetadataFile::Outs, &merged)?;
        self.join.write_time(MetadataFile::Complete)?;
        self.join.note_written(MetadataFile::Outs);
        self.join.note_written(MetadataFile::Complete);
        self.join.update_journal(MetadataFile::Complete);
        Ok(0)
    }

    fn finish(&mut self) -> Result<(), MetadataError> {
        let outs = match self.join.read_into::<Args>(MetadataFile::Outs) {
            Ok(outs) => outs,
            Err(e) if e.is_not_found() => Args::new(),
            Err(e) => {
                record_failure(&mut self.join, &format!("Join outputs could not be read: {e}"));
                return Ok(());
            }
        };
        self.publish(outs)?;
        info!(fqname = %self.spec.fqname, "stage complete");
        Ok(())
    }

    /// Completes a pipeline whose children all finished.
    pub fn finish_pipeline(&mut self, outs: Args) -> Result<(), MetadataError> {
        self.metadata.mkdirs()?;
        self.publish(outs)?;
        info!(fqname = %self.spec.fqname, "pipeline complete");
        Ok(())
    }

    fn publish(&mut self, outs: Args) -> Result<(), MetadataError> {
        self.metadata.write(MetadataFile::Outs, &outs)?;
        self.metadata.write_time(MetadataFile::Complete)?;
        self.metadata.note_written(MetadataFile::Outs);
        self.metadata.note_written(MetadataFile::Complete);
        self.metadata.update_journal(MetadataFile::Complete);
        self.outs = Some(outs);
        Ok(())
    }

    /// Records activity seen through the journal for one of this node's metadata.
    pub fn note_heartbeat(&mut self, journal_name: &str, at: SystemTime) {
        let entry = self
            .last_heartbeat
            .entry(journal_name.to_string())
            .or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    /// Fails running jobs whose last journal activity is older than `timeout`.
    ///
    /// Returns true if any job was failed.
    pub fn check_heartbeat(&mut self, now: SystemTime, timeout: Duration) -> bool {
        let Self {
            split,
            join,
            chunks,
            last_heartbeat,
            spec,
            ..
        } = self;
        let mut failed = false;
        let jobs = std::iter::once(split)
            .chain(chunks.iter_mut())
            .chain(std::iter::once(join));
        for meta in jobs {
            if meta.state() != MetadataState::Running {
                continue;
            }
            let last = *last_heartbeat
                .entry(meta.journal_name().to_string())
                .or_insert(now);
            let elapsed = now.duration_since(last).unwrap_or_default();
            if elapsed <= timeout {
                continue;
            }
            let minutes = elapsed.as_secs() / 60;
            warn!(fqname = %spec.fqname, job = meta.journal_name(), minutes, "heartbeat lost");
            record_failure(
                meta,
                &format!(
                    "No heartbeat detected for {minutes} minutes. Assuming job has failed. \
                     This may be due to the job being terminated by a user, by the operating \
                     system or by the cluster scheduler for exceeding a resource or time limit."
                ),
            );
            failed = true;
        }
        failed
    }

    /// Applies a queue query result.
    ///
    /// Queued jobs absent from `missing` are cleared; those listed stay
    /// marked and are failed once they have been missing for `grace`.
    pub fn apply_queue_check(
        &mut self,
        missing: &HashSet<&str>,
        now: SystemTime,
        grace: Duration,
    ) -> bool {
        let Self {
            split,
            join,
            chunks,
            not_running_since,
            spec,
            ..
        } = self;
        let mut failed = false;
        let jobs = std::iter::once(split)
            .chain(chunks.iter_mut())
            .chain(std::iter::once(join));
        for meta in jobs {
            let name = meta.journal_name().to_string();
            if meta.state() != MetadataState::Queued || !missing.contains(name.as_str()) {
                not_running_since.remove(&name);
                continue;
            }
            let since = *not_running_since.entry(name.clone()).or_insert(now);
            if now.duration_since(since).unwrap_or_default() < grace {
                continue;
            }
            let since_text = DateTime::<Local>::from(since).format("%Y-%m-%d %H:%M:%S");
            record_failure(
                meta,
                &format!(
                    "Job was not found in the queue. According to the job manager, the job \
                     for {} was not queued or running since at least {since_text}.",
                    spec.fqname
                ),
            );
            not_running_since.remove(&name);
            failed = true;
        }
        failed
    }

    /// Describes the first failed metadata of this node.
    #[must_use]
    pub fn failure_report(&self) -> Option<FailureReport> {
        let meta = self
            .all_metadata()
            .find(|m| m.state() == MetadataState::Failed)?;
        let (file, assert) = if meta.has(MetadataFile::Assert) {
            (MetadataFile::Assert, true)
        } else {
            (MetadataFile::Errors, false)
        };
        let message = meta.read_raw(file).unwrap_or_default();
        let log_tail = meta
            .read_raw(MetadataFile::Log)
            .map(|log| tail_lines(&log, LOG_TAIL_LINES))
            .unwrap_or_default();
        Some(FailureReport {
            fqname: self.spec.fqname.clone(),
            assert,
            message,
            log_tail,
            error_path: meta.metadata_file_path(file),
        })
    }

    /// Clears failed state so the node runs again.
    ///
    /// A partial reset restarts from the phase that failed; a full reset
    /// removes the whole node directory. Returns the journal names cleared.
    pub fn reset(&mut self, full: bool) -> Result<Vec<String>, MetadataError> {
        let chunk_failed = self
            .chunks
            .iter()
            .any(|c| c.state() == MetadataState::Failed);
        let whole = full
            || self.stage_defs.is_none()
            || self.metadata.state() == MetadataState::Failed
            || self.split.state() == MetadataState::Failed;

        let mut cleared = Vec::new();
        if whole {
            cleared = self.journal_names();
            for chunk in &mut self.chunks {
                chunk.remove_all()?;
            }
            self.split.remove_all()?;
            self.join.remove_all()?;
            self.metadata.remove_all()?;
            self.chunks.clear();
            self.stage_defs = None;
            self.outs = None;
        } else {
            if chunk_failed {
                for chunk in &mut self.chunks {
                    cleared.push(chunk.journal_name().to_string());
                    chunk.remove_all()?;
                }
            }
            cleared.push(self.join.journal_name().to_string());
            self.join.remove_all()?;
        }
        for name in &cleared {
            self.last_heartbeat.remove(name);
            self.not_running_since.remove(name);
        }
        info!(fqname = %self.spec.fqname, whole, "node reset");
        Ok(cleared)
    }

    /// Reconciles local jobs after the supervisor restarted.
    ///
    /// Jobs still waiting for a local reservation are reset so they are
    /// submitted again; running jobs whose process on `host` is gone are
    /// failed. Returns the journal names reset.
    pub fn restart_local_jobs(&mut self, host: &str) -> Result<Vec<String>, MetadataError> {
        let mut reset = Vec::new();
        let Self {
            split,
            join,
            chunks,
            spec,
            ..
        } = self;
        let jobs = std::iter::once(split)
            .chain(chunks.iter_mut())
            .chain(std::iter::once(join));
        for meta in jobs {
            let info = meta.read_into::<JobInfo>(MetadataFile::JobInfo).ok();
            match meta.state() {
                MetadataState::Queued
                    if meta.has(MetadataFile::QueuedLocally)
                        || info.as_ref().is_some_and(|i| i.job_type == "local") =>
                {
                    reset.push(meta.journal_name().to_string());
                    let args = meta.read_into::<Args>(MetadataFile::Args).ok();
                    meta.reset()?;
                    if let Some(args) = args {
                        meta.write(MetadataFile::Args, &args)?;
                        meta.note_written(MetadataFile::Args);
                    }
                    info!(fqname = %spec.fqname, job = meta.journal_name(), "requeueing local job");
                }
                MetadataState::Running => {
                    let Some(info) = info else { continue };
                    if info.pid == 0 || info.host != host || sys::process_alive(info.pid) {
                        continue;
                    }
                    record_failure(
                        meta,
                        &format!("Local job process {} is no longer running", info.pid),
                    );
                }
                _ => {}
            }
        }
        Ok(reset)
    }

    /// Lines workers wrote to `_alarm`.
    #[must_use]
    pub fn alarms(&self) -> Vec<String> {
        self.job_metadata()
            .filter_map(|m| m.read_raw(MetadataFile::Alarm).ok())
            .flat_map(|text| {
                text.lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Last line of the most recent `_progress` among running jobs.
    #[must_use]
    pub fn progress(&self) -> Option<String> {
        self.job_metadata()
            .filter(|m| m.state().is_active())
            .filter_map(|m| m.read_raw(MetadataFile::Progress).ok())
            .filter_map(|text| text.lines().last().map(str::to_string))
            .last()
    }

    /// Largest resident memory reported by any of this node's jobs.
    #[must_use]
    pub fn used_rss_bytes(&self) -> u64 {
        self.job_metadata()
            .filter_map(|m| m.read_into::<JobInfo>(MetadataFile::JobInfo).ok())
            .filter_map(|info| info.used_bytes.map(|m| m.rss))
            .max()
            .unwrap_or(0)
    }

    /// Files directories of the chunk jobs.
    #[must_use]
    pub fn chunk_files_paths(&self) -> Vec<PathBuf> {
        self.chunks.iter().map(Metadata::files_path).collect()
    }
}

fn submit_job(
    spec: &NodeSpec,
    meta: &mut Metadata,
    mode: JobMode,
    request: ResourceRequest,
    jm: &dyn JobManager,
) -> bool {
    let local = spec.modifiers.local;
    let reservation = match jm.resources(&request, local) {
        Ok(reservation) => reservation,
        Err(e) => {
            record_failure(meta, &e.to_string());
            return false;
        }
    };
    if !jm.can_submit(&reservation, local) {
        debug!(fqname = %spec.fqname, %mode, threads = reservation.threads, "job waiting for resources");
        return false;
    }
    let job = JobRequest::new(
        spec.fqname.clone(),
        mode,
        meta.clone(),
        spec.code.command.clone(),
        request,
    )
    .with_local(local);
    match jm.submit(job) {
        Ok(()) => {
            meta.note_written(MetadataFile::JobInfo);
            info!(fqname = %spec.fqname, %mode, job = meta.journal_name(), "job submitted");
            true
        }
        Err(e) => {
            record_failure(meta, &e.to_string());
            false
        }
    }
}

fn record_failure(meta: &mut Metadata, message: &str) {
    match meta.write_raw(MetadataFile::Errors, message) {
        Ok(()) => {
            meta.note_written(MetadataFile::Errors);
            meta.update_journal(MetadataFile::Errors);
        }
        Err(e) => warn!(job = meta.journal_name(), error = %e, "could not record failure"),
    }
}

/// Combines split chunk outputs key by key, one array element per chunk.
fn merge_chunk_outs(outs: &[Value]) -> Args {
    let mut merged = Args::new();
    for (i, out) in outs.iter().enumerate() {
        let Some(object) = out.as_object() else { continue };
        for (key, value) in object {
            let slot = merged
                .entry(key.clone())
                .or_insert_with(|| Value::Array(vec![Value::Null; outs.len()]));
            if let Some(items) = slot.as_array_mut() {
                items[i] = value.clone();
            }
        }
    }
    merged
}

fn tail_lines(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| (*l).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_node_dir_follows_fqname() {
        assert_eq!(
            node_dir(Path::new("/run"), "pipe.SUB.STAGE"),
            PathBuf::from("/run/pipe/SUB/STAGE")
        );
    }

    #[test]
    fn test_owns_journal_name() {
        let journal = Arc::new(Journal::new("/tmp/none"));
        let node = Node::new(NodeSpec::stage("p.A", vec![]), Path::new("/run"), journal);
        assert!(node.owns_journal_name("p.A"));
        assert!(node.owns_journal_name("p.A.split"));
        assert!(node.owns_journal_name("p.A.chnk12"));
        assert!(!node.owns_journal_name("p.A.chnk"));
        assert!(!node.owns_journal_name("p.AB"));
        assert!(!node.owns_journal_name("p.A.other"));
    }

    #[test]
    fn test_merge_chunk_outs() {
        let merged = merge_chunk_outs(&[json!({"a": 1, "b": "x"}), json!({"a": 2}), Value::Null]);
        assert_eq!(Value::Object(merged), json!({"a": [1, 2, null], "b": ["x", null, null]}));
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), vec!["b", "c"]);
        assert_eq!(tail_lines("a", 5), vec!["a"]);
    }
}
