//! # Stagerun
//!
//! Execution and monitoring engine for pipelines of split/chunk/join stages.
//!
//! Given a call graph of stages, stagerun schedules, launches, monitors,
//! retries and garbage-collects the jobs that run each stage, on the local
//! machine or through a cluster scheduler. All durable state lives on disk
//! as metadata files, so a restarted supervisor picks up where the previous
//! one stopped.
//!
//! - **Metadata store**: typed metadata files, atomic writes and a journal
//!   of change markers
//! - **Job monitor**: supervises one worker process, enforces memory quotas
//!   and reports the outcome (the `stagerun-monitor` binary)
//! - **Node state machine**: derives stage and pipeline states from metadata
//! - **Job managers**: local core/memory budget or cluster submission
//! - **Retries**: transient-failure classification and a per-run budget
//! - **VDR**: reclaims intermediate outputs nobody needs any more
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagerun::prelude::*;
//!
//! let signals = Arc::new(SignalRegistry::default());
//! let config = RuntimeConfig::from_file("stagerun.json")?;
//! let jm = job_manager(&config, &signals);
//! let mut supervisor = Supervisor::new(&graph, "/runs/p1", jm, config, signals)?;
//! let outcome = supervisor.run().await;
//! std::process::exit(outcome.exit_reason().exit_code());
//! ```

#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

#[cfg(not(unix))]
compile_error!("stagerun supervises Unix processes and only builds on Unix targets");

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod jobinfo;
pub mod jobmanager;
pub mod metadata;
pub mod monitor;
pub mod node;
pub mod observability;
pub mod perf;
pub mod retry;
pub mod signals;
pub mod supervisor;
pub mod sys;
pub mod testing;
pub mod ui;
pub mod vdr;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{RetryFile, RuntimeConfig};
    pub use crate::core::{JobState, NodeKind, ReportedState, ResourceRequest};
    pub use crate::errors::{StagerunError, Result};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, RunEvent};
    pub use crate::jobmanager::{
        ClusterJobManager, JobManager, JobModeConfig, LocalConfig, LocalJobManager,
    };
    pub use crate::metadata::{Metadata, MetadataFile};
    pub use crate::monitor::{Monitor, MonitorArgs, MonitorConfig, MonitorOutcome};
    pub use crate::node::{CallGraph, Modifiers, NodeSpec, NodeTree};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::signals::{ExitReason, SignalRegistry};
    pub use crate::supervisor::{job_manager, RunOutcome, Supervisor};
    pub use crate::ui::{PipelineSnapshot, SnapshotStore};
    pub use crate::vdr::VdrPolicy;
    pub use std::sync::Arc;
}
