//! Core domain model types for stagerun.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Per-metadata and per-node state enums
//! - Resource requests and their normalised reservations

mod resources;
mod state;

pub use resources::{JobResources, ResourceRequest};
pub use state::{JobState, MetadataState, NodeKind, ReportedState, StateQualifier};
