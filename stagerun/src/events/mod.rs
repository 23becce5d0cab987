//! Run events.
//!
//! The supervisor reports what happens to a run as [`RunEvent`]s through an
//! [`EventSink`]. Sinks never fail the run; delivery problems are logged.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::JobState;
use serde::Serialize;
use std::path::PathBuf;

/// Something that happened to a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A node moved between states.
    StateChanged {
        /// Fully-qualified node name.
        fqname: String,
        /// Previous state.
        from: JobState,
        /// New state.
        to: JobState,
    },
    /// A node failed and will be reset and relaunched.
    Retrying {
        /// Fully-qualified node name.
        fqname: String,
        /// Retries left after this one.
        remaining: u32,
        /// The failure text that was judged transient.
        excerpt: String,
    },
    /// A node failed for good.
    Failed {
        /// Fully-qualified node name.
        fqname: String,
        /// Lines to show the user.
        excerpt: String,
        /// File holding the full error.
        error_path: PathBuf,
    },
    /// Volatile data was removed.
    VolatileDataRemoved {
        /// Files removed.
        count: u64,
        /// Bytes removed.
        size: u64,
    },
    /// The run reached a terminal state.
    RunFinished {
        /// Pipeline name.
        name: String,
        /// Final state.
        state: JobState,
    },
}

impl RunEvent {
    /// Dotted event name used in logs.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "node.state_changed",
            Self::Retrying { .. } => "node.retrying",
            Self::Failed { .. } => "node.failed",
            Self::VolatileDataRemoved { .. } => "vdr.removed",
            Self::RunFinished { .. } => "run.finished",
        }
    }
}
