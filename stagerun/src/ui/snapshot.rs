//! Point-in-time views of a run for the state query interface.

use crate::core::{JobState, NodeKind, ReportedState};
use crate::metadata::timestamp;
use crate::node::{Node, NodeTree};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// One node as shown to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSnapshot {
    /// Fully-qualified node name.
    pub fqname: String,
    /// Stage or pipeline.
    pub kind: NodeKind,
    /// Current state.
    pub state: JobState,
    /// Number of chunks once the split has run.
    pub chunks: usize,
    /// Peak resident memory of any job of the node.
    pub used_rss_bytes: u64,
    /// Lines the worker wrote to `_alarm`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alarms: Vec<String>,
    /// Last `_progress` line of a running job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    /// Failure message of a failed node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// File holding the full failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_path: Option<PathBuf>,
}

impl NodeSnapshot {
    fn capture(node: &Node) -> Self {
        Self::assemble(node, NodeDetails::read(node))
    }

    fn assemble(node: &Node, details: NodeDetails) -> Self {
        Self {
            fqname: node.fqname().to_string(),
            kind: node.kind(),
            state: node.state(),
            chunks: node.chunks().len(),
            used_rss_bytes: details.used_rss_bytes,
            alarms: details.alarms,
            progress: details.progress,
            error: details.error,
            error_path: details.error_path,
        }
    }
}

/// The parts of a [`NodeSnapshot`] read from metadata files.
#[derive(Debug, Clone, Default)]
struct NodeDetails {
    state: JobState,
    used_rss_bytes: u64,
    alarms: Vec<String>,
    progress: Option<String>,
    error: Option<String>,
    error_path: Option<PathBuf>,
}

impl NodeDetails {
    fn read(node: &Node) -> Self {
        let failure = if node.state() == JobState::Failed {
            node.failure_report()
        } else {
            None
        };
        Self {
            state: node.state(),
            used_rss_bytes: node.used_rss_bytes(),
            alarms: node.alarms(),
            progress: node.progress(),
            error: failure.as_ref().map(|f| f.message.clone()),
            error_path: failure.map(|f| f.error_path),
        }
    }
}

/// Node details kept between poll cycles.
///
/// A node's files are re-read only when the journal refreshed it or its
/// state moved since the last capture.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    details: HashMap<String, NodeDetails>,
}

impl SnapshotCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures `tree`, re-reading only `refreshed` nodes, nodes whose state
    /// changed and nodes never captured before.
    pub fn capture(
        &mut self,
        tree: &NodeTree,
        refreshed: &[String],
        state: ReportedState,
        retries_remaining: u32,
    ) -> PipelineSnapshot {
        for fqname in refreshed {
            self.details.remove(fqname);
        }
        let nodes = tree
            .nodes()
            .iter()
            .map(|node| {
                let details = match self.details.get(node.fqname()) {
                    Some(cached) if cached.state == node.state() => cached.clone(),
                    _ => {
                        let fresh = NodeDetails::read(node);
                        self.details.insert(node.fqname().to_string(), fresh.clone());
                        fresh
                    }
                };
                NodeSnapshot::assemble(node, details)
            })
            .collect();
        PipelineSnapshot {
            name: tree.name().to_string(),
            state,
            retries_remaining,
            updated: timestamp(),
            nodes,
        }
    }
}

/// The whole run as shown to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    /// Pipeline name.
    pub name: String,
    /// Run state with its reporting qualifier.
    pub state: ReportedState,
    /// Retry tokens left.
    pub retries_remaining: u32,
    /// When the snapshot was taken.
    pub updated: String,
    /// Every node in evaluation order.
    pub nodes: Vec<NodeSnapshot>,
}

impl PipelineSnapshot {
    /// Captures every node of `tree`.
    #[must_use]
    pub fn capture(tree: &NodeTree, state: ReportedState, retries_remaining: u32) -> Self {
        Self {
            name: tree.name().to_string(),
            state,
            retries_remaining,
            updated: timestamp(),
            nodes: tree.nodes().iter().map(NodeSnapshot::capture).collect(),
        }
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, fqname: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.fqname == fqname)
    }
}

/// Latest snapshot, shared between the poll loop and readers.
///
/// Readers get an `Arc` to an immutable snapshot and never block the writer
/// for longer than a pointer swap.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    latest: Arc<RwLock<Option<Arc<PipelineSnapshot>>>>,
}

impl SnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current snapshot.
    pub fn publish(&self, snapshot: PipelineSnapshot) {
        *self.latest.write() = Some(Arc::new(snapshot));
    }

    /// The most recently published snapshot.
    #[must_use]
    pub fn latest(&self) -> Option<Arc<PipelineSnapshot>> {
        self.latest.read().clone()
    }
}
