//! The expanded graph of one run.

use super::graph::CallGraph;
use super::stage::{Args, Node};
use crate::core::{JobState, NodeKind};
use crate::errors::GraphError;
use crate::jobmanager::JobManager;
use crate::metadata::{Journal, JournalEntry};
use crate::retry::FailureReport;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// A node whose state changed during an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// Fully-qualified node name.
    pub fqname: String,
    /// State before the update.
    pub from: JobState,
    /// State after the update.
    pub to: JobState,
}

/// Every node of a run, in evaluation order.
///
/// The tree is only touched from the supervisor's poll loop, so it holds no
/// locks.
#[derive(Debug)]
pub struct NodeTree {
    name: String,
    root: PathBuf,
    journal: Arc<Journal>,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    refreshed: BTreeSet<usize>,
}

impl NodeTree {
    /// Expands `graph` into runtime nodes rooted at `root`.
    pub fn new(
        graph: &CallGraph,
        root: impl Into<PathBuf>,
        journal: Arc<Journal>,
    ) -> Result<Self, GraphError> {
        let root = root.into();
        let nodes: Vec<Node> = graph
            .evaluation_order()?
            .into_iter()
            .map(|spec| Node::new(spec.clone(), &root, Arc::clone(&journal)))
            .collect();
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.fqname().to_string(), i))
            .collect();
        Ok(Self {
            name: graph.name.clone(),
            root,
            journal,
            nodes,
            index,
            refreshed: BTreeSet::new(),
        })
    }

    /// Name of the top-level pipeline.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The run directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The journal every node signals through.
    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// Nodes in evaluation order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, fqname: &str) -> Option<&Node> {
        self.index.get(fqname).map(|&i| &self.nodes[i])
    }

    /// The top-level pipeline node, if the graph declares one.
    #[must_use]
    pub fn root_node(&self) -> Option<&Node> {
        self.node(&self.name)
    }

    /// Re-derives every node from disk, as after a supervisor restart.
    pub fn load(&mut self, now: SystemTime) -> Vec<StateChange> {
        for node in &mut self.nodes {
            if let Err(e) = node.load(now) {
                warn!(fqname = %node.fqname(), error = %e, "could not load node metadata");
            }
        }
        self.update_states()
    }

    fn owner_of(&self, journal_name: &str) -> Option<usize> {
        if let Some(&i) = self.index.get(journal_name) {
            return Some(i);
        }
        let (prefix, _) = journal_name.rsplit_once('.')?;
        self.index
            .get(prefix)
            .copied()
            .filter(|&i| self.nodes[i].owns_journal_name(journal_name))
    }

    /// Refreshes the nodes named by new journal entries.
    ///
    /// Returns the number of nodes refreshed.
    pub fn apply_journal(&mut self, entries: &[JournalEntry], now: SystemTime) -> usize {
        let mut dirty = BTreeSet::new();
        for entry in entries {
            let Some(i) = self.owner_of(&entry.name) else {
                debug!(name = %entry.name, "journal entry for unknown node");
                continue;
            };
            self.nodes[i].note_heartbeat(&entry.name, entry.modified.unwrap_or(now));
            dirty.insert(i);
        }
        for &i in &dirty {
            let node = &mut self.nodes[i];
            if let Err(e) = node.refresh() {
                warn!(fqname = %node.fqname(), error = %e, "could not refresh node metadata");
            }
        }
        let count = dirty.len();
        self.refreshed.extend(dirty);
        count
    }

    /// Names of the nodes refreshed from the journal since the last call.
    pub fn take_refreshed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.refreshed)
            .into_iter()
            .map(|i| self.nodes[i].fqname().to_string())
            .collect()
    }

    fn state_of(&self, fqname: &str) -> JobState {
        self.index
            .get(fqname)
            .map_or(JobState::Waiting, |&i| self.nodes[i].state())
    }

    /// Recomputes every node's state, producers before consumers.
    pub fn update_states(&mut self) -> Vec<StateChange> {
        let preflight_done = self
            .nodes
            .iter()
            .filter(|n| n.spec().modifiers.preflight)
            .all(|n| n.state().is_satisfied());

        let mut changes = Vec::new();
        for i in 0..self.nodes.len() {
            let node = &self.nodes[i];
            let spec = node.spec();
            let next = match spec.kind {
                NodeKind::Stage => {
                    let ready = (spec.modifiers.preflight || preflight_done)
                        && spec
                            .prenodes()
                            .into_iter()
                            .all(|p| self.state_of(p).is_satisfied());
                    node.derive_stage_state(ready)
                }
                NodeKind::Pipeline => {
                    let children =
                        JobState::aggregate(spec.children.iter().map(|c| self.state_of(c)));
                    node.derive_pipeline_state(children)
                }
            };
            let previous = node.state();
            if next != previous {
                changes.push(StateChange {
                    fqname: node.fqname().to_string(),
                    from: previous,
                    to: next,
                });
                self.nodes[i].set_state(next);
            }
        }
        changes
    }

    /// State of the whole run.
    #[must_use]
    pub fn state(&self) -> JobState {
        match self.root_node() {
            Some(root) => root.state(),
            None => JobState::aggregate(
                self.nodes
                    .iter()
                    .filter(|n| n.kind() == NodeKind::Stage)
                    .map(Node::state),
            ),
        }
    }

    /// Arguments of node `i`: its own plus the outputs it is bound to.
    fn resolve_args(&self, i: usize) -> Args {
        let spec = self.nodes[i].spec();
        let mut args = spec.args.clone();
        for binding in &spec.bindings {
            let value = self
                .node(&binding.source)
                .and_then(Node::outs)
                .and_then(|outs| outs.get(&binding.output))
                .cloned()
                .unwrap_or(Value::Null);
            args.insert(binding.arg_name().to_string(), value);
        }
        args
    }

    /// Advances every node that can move without waiting on a job.
    ///
    /// Returns the number of jobs submitted.
    pub fn step(&mut self, jm: &dyn JobManager) -> usize {
        let mut submitted = 0;
        for i in 0..self.nodes.len() {
            let state = self.nodes[i].state();
            let kind = self.nodes[i].kind();
            let steppable = match kind {
                NodeKind::Stage => matches!(
                    state,
                    JobState::Ready
                        | JobState::SplitComplete
                        | JobState::ChunksRunning
                        | JobState::ChunksComplete
                        | JobState::JoinComplete
                ),
                NodeKind::Pipeline => state == JobState::JoinComplete,
            };
            if !steppable {
                continue;
            }
            let args = self.resolve_args(i);
            let node = &mut self.nodes[i];
            let result = match kind {
                NodeKind::Stage => node.step(&args, jm),
                NodeKind::Pipeline => node.finish_pipeline(args).map(|()| 0),
            };
            match result {
                Ok(n) => submitted += n,
                Err(e) => warn!(fqname = %node.fqname(), error = %e, "could not advance node"),
            }
        }
        submitted
    }

    /// Fails running jobs without recent journal activity.
    ///
    /// Returns the number of nodes with a newly failed job.
    pub fn check_heartbeats(&mut self, now: SystemTime, timeout: Duration) -> usize {
        self.nodes
            .iter_mut()
            .filter(|n| n.kind() == NodeKind::Stage && !n.state().is_terminal())
            .map(|n| n.check_heartbeat(now, timeout))
            .filter(|failed| *failed)
            .count()
    }

    /// Applies the journal names a queue query reported missing.
    ///
    /// Returns the number of nodes with a newly failed job.
    pub fn apply_queue_check(&mut self, missing: &[String], now: SystemTime, grace: Duration) -> usize {
        let missing: HashSet<&str> = missing.iter().map(String::as_str).collect();
        self.nodes
            .iter_mut()
            .filter(|n| n.kind() == NodeKind::Stage)
            .map(|n| n.apply_queue_check(&missing, now, grace))
            .filter(|failed| *failed)
            .count()
    }

    /// Failure reports of every failed stage.
    #[must_use]
    pub fn failures(&self) -> Vec<FailureReport> {
        self.nodes
            .iter()
            .filter(|n| n.kind() == NodeKind::Stage && n.state() == JobState::Failed)
            .filter_map(Node::failure_report)
            .collect()
    }

    /// Resets every failed stage. Returns the journal names cleared.
    pub fn reset_failed(&mut self, full: bool) -> Vec<String> {
        let mut cleared = Vec::new();
        for node in &mut self.nodes {
            if node.kind() != NodeKind::Stage || node.state() != JobState::Failed {
                continue;
            }
            match node.reset(full) {
                Ok(names) => cleared.extend(names),
                Err(e) => warn!(fqname = %node.fqname(), error = %e, "could not reset node"),
            }
        }
        cleared
    }

    /// Reconciles local jobs after a supervisor restart.
    pub fn restart_local_jobs(&mut self, host: &str) -> Vec<String> {
        let mut reset = Vec::new();
        for node in &mut self.nodes {
            if node.kind() != NodeKind::Stage || node.state().is_terminal() {
                continue;
            }
            match node.restart_local_jobs(host) {
                Ok(names) => reset.extend(names),
                Err(e) => warn!(fqname = %node.fqname(), error = %e, "could not restart local jobs"),
            }
        }
        reset
    }
}
