//! Node kind and state enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a call-graph node is a leaf stage or a pipeline of other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A leaf stage that runs a worker executable.
    #[default]
    Stage,
    /// A sub-pipeline, flattened to its leaf stages at schedule time.
    Pipeline,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage => write!(f, "stage"),
            Self::Pipeline => write!(f, "pipeline"),
        }
    }
}

/// State of a single metadata directory, derived purely from which files exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataState {
    /// Nothing has been handed to a job manager yet.
    #[default]
    Waiting,
    /// `_jobinfo` exists: a job manager accepted the job.
    Queued,
    /// `_log` exists: the job monitor started.
    Running,
    /// `_complete` exists.
    Complete,
    /// `_errors` or `_assert` exists.
    Failed,
    /// `_disabled` exists: the node was switched off.
    Disabled,
}

impl fmt::Display for MetadataState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

impl MetadataState {
    /// Returns true for queued or running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

/// The state of a node in the expanded graph.
///
/// `Running` is refined for split stages into the three phases, each of which
/// also has a completed form the node state machine steps from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Some upstream node is not complete yet.
    #[default]
    Waiting,
    /// All upstream bindings are satisfied.
    Ready,
    /// Handed to the job manager, not started yet.
    Queued,
    /// A non-split job is running.
    Running,
    /// The split phase is running.
    SplitRunning,
    /// The split phase finished; chunks not created yet.
    SplitComplete,
    /// At least one chunk is unfinished.
    ChunksRunning,
    /// Every chunk finished; join not started yet.
    ChunksComplete,
    /// The join phase is running.
    JoinRunning,
    /// The join phase finished; outputs not published yet.
    JoinComplete,
    /// Outputs are published.
    Complete,
    /// Some phase failed.
    Failed,
    /// The node was switched off and counts as satisfied.
    Disabled,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::SplitRunning => "split_running",
            Self::SplitComplete => "split_complete",
            Self::ChunksRunning => "chunks_running",
            Self::ChunksComplete => "chunks_complete",
            Self::JoinRunning => "join_running",
            Self::JoinComplete => "join_complete",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

impl JobState {
    /// Returns true if the node will not change state without a reset.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Disabled)
    }

    /// Returns true if downstream nodes may consume this node.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Complete | Self::Disabled)
    }

    /// Returns true if the state indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Returns true if some job of the node is in flight or between phases.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Running
                | Self::SplitRunning
                | Self::SplitComplete
                | Self::ChunksRunning
                | Self::ChunksComplete
                | Self::JoinRunning
                | Self::JoinComplete
        )
    }

    /// Reduces child states into the state of their parent pipeline.
    ///
    /// Failed wins, then running, queued, ready and waiting in that order.
    /// The parent is complete only when every child is satisfied.
    pub fn aggregate<I>(states: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let mut any = false;
        let mut best: Option<Self> = None;
        for state in states {
            any = true;
            if state.is_satisfied() {
                continue;
            }
            let rank = Self::aggregate_rank(state);
            if best.map_or(true, |b| rank > Self::aggregate_rank(b)) {
                best = Some(state);
            }
        }
        match best {
            Some(s) if s.is_running() => Self::Running,
            Some(s) => s,
            None if any => Self::Complete,
            None => Self::Waiting,
        }
    }

    fn aggregate_rank(state: Self) -> u8 {
        match state {
            Self::Complete | Self::Disabled => 0,
            Self::Waiting => 1,
            Self::Ready => 2,
            Self::Queued => 3,
            Self::Failed => 5,
            _ => 4,
        }
    }
}

/// Transient qualifier attached to a pipeline state for external reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateQualifier {
    /// The run is finishing up (VDR, final snapshot) before exiting.
    Cleanup,
    /// A retry token was consumed and the run is waiting to relaunch.
    Retrying,
}

/// A pipeline state as shown to the monitoring UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedState {
    /// The underlying aggregate state.
    pub state: JobState,
    /// Optional transient sub-state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<StateQualifier>,
}

impl ReportedState {
    /// Creates an unqualified reported state.
    #[must_use]
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            qualifier: None,
        }
    }

    /// Attaches a qualifier.
    #[must_use]
    pub fn with_qualifier(mut self, qualifier: StateQualifier) -> Self {
        self.qualifier = Some(qualifier);
        self
    }
}

impl From<JobState> for ReportedState {
    fn from(state: JobState) -> Self {
        Self::new(state)
    }
}

impl fmt::Display for ReportedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.qualifier {
            None => write!(f, "{}", self.state),
            Some(StateQualifier::Cleanup) => write!(f, "{}.cleanup", self.state),
            Some(StateQualifier::Retrying) => write!(f, "{}.retrying", self.state),
        }
    }
}
