//! The node state machine.
//!
//! - [`CallGraph`] is the immutable graph the run starts from
//! - [`Node`] derives a stage's state purely from its metadata and drives it
//!   through split, chunks and join
//! - [`NodeTree`] holds every node, reduces pipeline states and applies
//!   journal changes, heartbeat checks and queue checks

mod graph;
#[cfg(test)]
mod node_tests;
mod stage;
mod tree;

pub use graph::{Binding, CallGraph, Modifiers, NodeSpec, OutputDecl, StageCode};
pub use stage::{node_dir, Args, ChunkDef, Node, StageDefs};
pub use tree::{NodeTree, StateChange};
