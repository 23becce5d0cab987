//! Fixtures for driving a run without the supervisor loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::core::JobState;
use crate::errors::GraphError;
use crate::jobmanager::JobManager;
use crate::metadata::{Journal, JournalScanner, JOURNAL_DIR};
use crate::node::{CallGraph, NodeSpec, NodeTree, StateChange};

/// A run directory with its journal, a tree and a scanner.
#[derive(Debug)]
pub struct RunFixture {
    /// The expanded graph.
    pub tree: NodeTree,
    /// Reader over the run's journal.
    pub scanner: JournalScanner,
    root: PathBuf,
}

impl RunFixture {
    /// Builds a run rooted at `root` and loads it from disk.
    pub fn new(graph: &CallGraph, root: impl Into<PathBuf>) -> Result<Self, GraphError> {
        let root = root.into();
        let journal = Arc::new(Journal::new(root.join(JOURNAL_DIR)));
        let _ = journal.ensure_dir();
        let mut tree = NodeTree::new(graph, root.clone(), Arc::clone(&journal))?;
        tree.load(SystemTime::now());
        Ok(Self {
            tree,
            scanner: JournalScanner::new(journal.dir()),
            root,
        })
    }

    /// The run directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// One poll cycle: scan the journal, update states, then step.
    pub fn cycle(&mut self, jm: &dyn JobManager) -> Vec<StateChange> {
        let now = SystemTime::now();
        if let Ok(entries) = self.scanner.scan() {
            self.tree.apply_journal(&entries, now);
        }
        let changes = self.tree.update_states();
        self.tree.step(jm);
        changes
    }

    /// Cycles until the run is complete or failed, at most `limit` times.
    pub fn run_until_settled(&mut self, jm: &dyn JobManager, limit: usize) -> JobState {
        for _ in 0..limit {
            self.cycle(jm);
            let state = self.tree.state();
            if state.is_terminal() {
                return state;
            }
        }
        self.tree.state()
    }

    /// Forgets journal names after a reset so their new markers are seen.
    pub fn forget(&mut self, names: &[String]) {
        for name in names {
            self.scanner.forget(name);
        }
    }
}

/// A pipeline `name` of `count` stages, each consuming the previous one's `out`.
#[must_use]
pub fn linear_graph(name: &str, count: usize) -> CallGraph {
    let stages: Vec<String> = (0..count).map(|i| format!("{name}.S{i}")).collect();
    let mut graph = CallGraph::new(name);
    for (i, fqname) in stages.iter().enumerate() {
        let mut spec = NodeSpec::stage(fqname.clone(), vec!["/bin/true".to_string()])
            .with_output("out", false);
        if i > 0 {
            spec = spec.with_binding(stages[i - 1].clone(), "out");
        }
        graph = graph.with_node(spec);
    }
    graph.with_node(NodeSpec::pipeline(name, stages))
}
