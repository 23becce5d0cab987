//! Testing utilities for stagerun.
//!
//! This module provides:
//! - A job manager that writes scripted outcomes into metadata
//! - Run fixtures that drive the node tree cycle by cycle

mod fixtures;
mod scripted;

pub use fixtures::{linear_graph, RunFixture};
pub use scripted::{Outcome, ScriptedJobManager, Submitted};
