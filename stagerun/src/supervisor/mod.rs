//! The supervisor poll loop.
//!
//! One [`Supervisor`] owns a run. Each cycle it reads new journal markers,
//! checks the cluster queue and heartbeats, derives node states, handles
//! failures and then steps every node that can move. Cycles are serialized,
//! so the node tree, the retry budget and the VDR counts need no locks.
//!
//! The loop wakes every poll interval, or earlier when the job manager
//! reports a finished job.

use crate::config::RuntimeConfig;
use crate::core::{JobState, NodeKind, ReportedState, StateQualifier};
use crate::errors::StagerunError;
use crate::events::{EventSink, LoggingEventSink, RunEvent};
use crate::jobmanager::{ClusterJobManager, JobManager, LocalJobManager};
use crate::metadata::{Journal, JournalScanner, MetadataFile, JOURNAL_DIR};
use crate::node::{CallGraph, NodeTree, StateChange};
use crate::retry::{Classification, FailureReport, RetryBudget, RetryClassifier};
use crate::signals::{ExitReason, SignalRegistry};
use crate::ui::{PipelineSnapshot, SnapshotCache, SnapshotStore};
use crate::vdr::{VdrCollector, VdrKillReport};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use sysinfo::System;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[cfg(test)]
mod supervisor_tests;

/// Builds the job manager `config` asks for.
///
/// Stages marked local-only always go to the local manager. Every job's
/// `_jobinfo` carries `config.monitor` for its monitor.
#[must_use]
pub fn job_manager(config: &RuntimeConfig, signals: &Arc<SignalRegistry>) -> Arc<dyn JobManager> {
    let local: Arc<dyn JobManager> = Arc::new(
        LocalJobManager::new(config.local.clone(), Arc::clone(signals))
            .with_monitor_settings(config.monitor.clone()),
    );
    match &config.cluster {
        Some(cluster) => Arc::new(
            ClusterJobManager::new(cluster.clone(), local, Arc::clone(signals))
                .with_monitor_settings(config.monitor.clone()),
        ),
        None => local,
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Final state of the run.
    pub state: JobState,
    /// Retry tokens consumed.
    pub retries_used: u32,
    /// Failures that ended the run.
    pub failures: Vec<FailureReport>,
    /// Everything VDR reclaimed.
    pub vdr: VdrKillReport,
    /// The run stopped because of a termination signal.
    pub interrupted: bool,
}

impl RunOutcome {
    /// The exit reason the entry point should report.
    #[must_use]
    pub fn exit_reason(&self) -> ExitReason {
        match self.state {
            JobState::Complete => ExitReason::Completed,
            _ => ExitReason::Fault,
        }
    }
}

enum FailureVerdict {
    Retried,
    Final(Vec<FailureReport>),
}

/// Drives one run to completion.
pub struct Supervisor {
    run_id: Uuid,
    tree: NodeTree,
    scanner: JournalScanner,
    jm: Arc<dyn JobManager>,
    config: RuntimeConfig,
    signals: Arc<SignalRegistry>,
    classifier: RetryClassifier,
    budget: RetryBudget,
    vdr: VdrCollector,
    vdr_total: VdrKillReport,
    events: Arc<dyn EventSink>,
    snapshots: SnapshotStore,
    snapshot_cache: SnapshotCache,
    reported: HashSet<String>,
    last_queue_check: Option<Instant>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("run_id", &self.run_id)
            .field("run", &self.tree.name())
            .field("state", &self.tree.state())
            .field("retries_remaining", &self.budget.remaining())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Opens the run directory `root` and re-derives every node from disk.
    ///
    /// Local jobs left behind by a previous supervisor are requeued or failed.
    pub fn new(
        graph: &CallGraph,
        root: impl Into<PathBuf>,
        jm: Arc<dyn JobManager>,
        config: RuntimeConfig,
        signals: Arc<SignalRegistry>,
    ) -> Result<Self, StagerunError> {
        let root = root.into();
        let journal = Arc::new(Journal::new(root.join(JOURNAL_DIR)));
        journal.ensure_dir()?;
        let mut tree = NodeTree::new(graph, &root, Arc::clone(&journal))?;
        tree.load(SystemTime::now());

        let host = System::host_name().unwrap_or_default();
        let requeued = tree.restart_local_jobs(&host);
        if !requeued.is_empty() {
            info!(count = requeued.len(), "requeued local jobs of a previous run");
        }

        let classifier = RetryClassifier::new(&config.retry.retry_on)?;
        let vdr = VdrCollector::new(config.vdr, &tree);
        let supervisor = Self {
            run_id: Uuid::now_v7(),
            scanner: JournalScanner::new(journal.dir()),
            budget: RetryBudget::new(config.retry.max_retries),
            tree,
            jm,
            signals,
            classifier,
            vdr,
            vdr_total: VdrKillReport::default(),
            events: Arc::new(LoggingEventSink::default()),
            snapshots: SnapshotStore::new(),
            snapshot_cache: SnapshotCache::new(),
            reported: HashSet::new(),
            last_queue_check: None,
            config,
        };
        supervisor.record_invocation(graph);
        Ok(supervisor)
    }

    /// Sends run events to `sink` instead of the log.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Publishes snapshots into `store`.
    #[must_use]
    pub fn with_snapshot_store(mut self, store: SnapshotStore) -> Self {
        self.snapshots = store;
        self
    }

    /// Identifies this supervisor session in logs.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The node tree.
    #[must_use]
    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    /// The run directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.tree.root()
    }

    /// Where snapshots are published.
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Retry tokens left.
    #[must_use]
    pub fn retries_remaining(&self) -> u32 {
        self.budget.remaining()
    }

    fn record_invocation(&self, graph: &CallGraph) {
        let Some(root) = self.tree.root_node() else {
            return;
        };
        let meta = root.metadata();
        if let Err(e) = meta.mkdirs() {
            warn!(error = %e, "could not create the pipeline directory");
            return;
        }
        let mode = match &self.config.cluster {
            Some(cluster) => cluster.name.as_str(),
            None => "local",
        };
        if let Err(e) = meta
            .write(MetadataFile::Invocation, graph)
            .and_then(|()| meta.write_raw(MetadataFile::JobMode, mode))
        {
            warn!(error = %e, "could not record the invocation");
        }
    }

    /// Runs cycles until the run completes, fails for good or is interrupted.
    pub async fn run(&mut self) -> RunOutcome {
        info!(
            run_id = %self.run_id,
            run = %self.tree.name(),
            root = %self.tree.root().display(),
            retries = self.budget.max(),
            vdr = ?self.vdr.policy(),
            "supervising run"
        );
        let done = self.jm.done();
        let outcome = loop {
            if self.signals.is_shutting_down() {
                warn!(run = %self.tree.name(), "shutdown requested, leaving the poll loop");
                break self.outcome(self.tree.state(), Vec::new(), true);
            }
            if let Some(outcome) = self.cycle().await {
                break outcome;
            }
            tokio::select! {
                () = tokio::time::sleep(self.config.poll.interval()) => {}
                () = done.notified() => debug!("woken by a finished job"),
            }
        };
        self.linger().await;
        outcome
    }

    /// One pass over the graph. Returns the outcome once the run is over.
    pub async fn cycle(&mut self) -> Option<RunOutcome> {
        let now = SystemTime::now();
        self.refresh(now);
        self.check_queue(now).await;
        self.tree.check_heartbeats(now, self.config.heartbeat.timeout());
        self.update_states().await;

        if self.tree.state() == JobState::Complete {
            return Some(self.finish(JobState::Complete, Vec::new()).await);
        }

        let failures = self.new_failures();
        if !failures.is_empty() {
            if let FailureVerdict::Final(failures) = self.handle_failures(failures).await {
                for failure in &failures {
                    self.reported.insert(failure.fqname.clone());
                }
            }
        }

        self.jm.refresh_resources();
        let submitted = self.tree.step(self.jm.as_ref());
        if submitted > 0 {
            debug!(submitted, "jobs submitted");
        }

        if !self.reported.is_empty() && !self.in_flight() {
            let failures = self.tree.failures();
            return Some(self.finish(JobState::Failed, failures).await);
        }
        self.publish(ReportedState::new(self.tree.state()));
        None
    }

    fn refresh(&mut self, now: SystemTime) {
        match self.scanner.scan() {
            Ok(entries) => {
                let touched = self.tree.apply_journal(&entries, now);
                if touched > 0 {
                    debug!(entries = entries.len(), touched, "journal changes applied");
                }
            }
            Err(e) => warn!(error = %e, "could not scan the journal"),
        }
    }

    async fn check_queue(&mut self, now: SystemTime) {
        let Some(grace) = self.jm.queue_check_grace() else {
            return;
        };
        let interval = std::time::Duration::from_secs(self.config.poll.queue_check_interval_secs);
        if self
            .last_queue_check
            .is_some_and(|last| last.elapsed() < interval)
        {
            return;
        }
        self.last_queue_check = Some(Instant::now());
        let missing = self.jm.check_queue().await;
        let failed = self.tree.apply_queue_check(&missing, now, grace);
        if failed > 0 {
            warn!(failed, "jobs missing from the cluster queue");
        }
    }

    async fn update_states(&mut self) {
        let changes = self.tree.update_states();
        for change in changes {
            self.on_state_change(change).await;
        }
    }

    async fn on_state_change(&mut self, change: StateChange) {
        let StateChange { fqname, from, to } = change;
        info!(fqname = %fqname, from = %from, to = %to, "node state changed");
        self.events
            .emit(&RunEvent::StateChanged {
                fqname: fqname.clone(),
                from,
                to,
            })
            .await;
        if to == JobState::Complete {
            let report = self.vdr.on_node_complete(&fqname, &self.tree);
            self.note_vdr(report).await;
        }
    }

    async fn note_vdr(&mut self, report: VdrKillReport) {
        if report.is_empty() {
            return;
        }
        self.events
            .emit(&RunEvent::VolatileDataRemoved {
                count: report.count,
                size: report.size,
            })
            .await;
        self.vdr_total.merge(&report);
    }

    fn new_failures(&self) -> Vec<FailureReport> {
        self.tree
            .failures()
            .into_iter()
            .filter(|f| !self.reported.contains(&f.fqname))
            .collect()
    }

    fn classify(&self, failures: &[FailureReport]) -> Vec<Classification> {
        failures
            .iter()
            .map(|f| self.classifier.is_error_transient(f))
            .collect()
    }

    /// Retries a burst of transient failures with one token, or reports them.
    async fn handle_failures(&mut self, failures: Vec<FailureReport>) -> FailureVerdict {
        let verdicts = self.classify(&failures);
        let retryable = self.reported.is_empty() && verdicts.iter().all(|c| c.transient);
        if !retryable || !self.budget.consume() {
            if retryable {
                info!("retry budget exhausted");
            }
            self.report_failures(&failures, &verdicts).await;
            return FailureVerdict::Final(failures);
        }

        for (failure, verdict) in failures.iter().zip(&verdicts) {
            self.events
                .emit(&RunEvent::Retrying {
                    fqname: failure.fqname.clone(),
                    remaining: self.budget.remaining(),
                    excerpt: verdict.excerpt.clone(),
                })
                .await;
        }
        self.publish(ReportedState::new(JobState::Failed).with_qualifier(StateQualifier::Retrying));

        // Failures tend to arrive in bursts; gather the rest before resetting.
        tokio::time::sleep(self.config.retry.wait()).await;
        let now = SystemTime::now();
        self.refresh(now);
        self.tree.check_heartbeats(now, self.config.heartbeat.timeout());
        self.update_states().await;

        let burst = self.tree.failures();
        let burst_verdicts = self.classify(&burst);
        if let Some(i) = burst_verdicts.iter().position(|c| !c.transient) {
            let (failure, verdict) = (&burst[i], &burst_verdicts[i]);
            self.report_failures(std::slice::from_ref(failure), std::slice::from_ref(verdict))
                .await;
            return FailureVerdict::Final(vec![failure.clone()]);
        }

        let cleared = self.tree.reset_failed(self.config.retry.full_reset);
        for name in &cleared {
            self.scanner.forget(name);
        }
        info!(
            nodes = burst.len(),
            jobs = cleared.len(),
            remaining = self.budget.remaining(),
            "retrying transient failures"
        );
        self.update_states().await;
        FailureVerdict::Retried
    }

    async fn report_failures(&self, failures: &[FailureReport], verdicts: &[Classification]) {
        for (failure, verdict) in failures.iter().zip(verdicts) {
            error!(
                fqname = %failure.fqname,
                error_path = %failure.error_path.display(),
                "stage failed"
            );
            self.events
                .emit(&RunEvent::Failed {
                    fqname: failure.fqname.clone(),
                    excerpt: verdict.excerpt.clone(),
                    error_path: failure.error_path.clone(),
                })
                .await;
        }
    }

    /// Whether any stage still has a job queued, running or ready to submit.
    fn in_flight(&self) -> bool {
        self.tree.nodes().iter().any(|n| {
            let state = n.state();
            n.kind() == NodeKind::Stage
                && (state.is_running() || matches!(state, JobState::Queued | JobState::Ready))
        })
    }

    fn publish(&mut self, state: ReportedState) {
        let refreshed = self.tree.take_refreshed();
        let snapshot = self.snapshot_cache.capture(
            &self.tree,
            &refreshed,
            state,
            self.budget.remaining(),
        );
        self.snapshots.publish(snapshot);
    }

    async fn finish(&mut self, state: JobState, failures: Vec<FailureReport>) -> RunOutcome {
        self.publish(ReportedState::new(state).with_qualifier(StateQualifier::Cleanup));
        if state == JobState::Complete {
            let report = self.vdr.post_run(&self.tree);
            self.note_vdr(report).await;
        }

        let snapshot = PipelineSnapshot::capture(&self.tree, state.into(), self.budget.remaining());
        if let Some(root) = self.tree.root_node() {
            if let Err(e) = root.metadata().write(MetadataFile::FinalState, &snapshot) {
                warn!(error = %e, "could not write the final state");
            }
        }
        self.snapshots.publish(snapshot);

        self.events
            .emit(&RunEvent::RunFinished {
                name: self.tree.name().to_string(),
                state,
            })
            .await;
        match state {
            JobState::Complete => info!(
                run_id = %self.run_id,
                run = %self.tree.name(),
                vdr_files = self.vdr_total.count,
                vdr_bytes = self.vdr_total.size,
                "run complete"
            ),
            _ => error!(
                run_id = %self.run_id,
                run = %self.tree.name(),
                failures = failures.len(),
                "run failed"
            ),
        }
        self.outcome(state, failures, false)
    }

    fn outcome(&self, state: JobState, failures: Vec<FailureReport>, interrupted: bool) -> RunOutcome {
        RunOutcome {
            state,
            retries_used: self.budget.max() - self.budget.remaining(),
            failures,
            vdr: self.vdr_total.clone(),
            interrupted,
        }
    }

    async fn linger(&self) {
        if self.config.linger_secs == 0 || self.signals.is_shutting_down() {
            return;
        }
        info!(seconds = self.config.linger_secs, "keeping the final state available");
        tokio::time::sleep(std::time::Duration::from_secs(self.config.linger_secs)).await;
    }
}
