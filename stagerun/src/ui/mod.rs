//! State query interface.
//!
//! The poll loop publishes a [`PipelineSnapshot`] into a [`SnapshotStore`]
//! every cycle; with the `ui` feature a [`UiServer`] serves it over HTTP.

#[cfg(feature = "ui")]
mod server;
mod snapshot;

#[cfg(feature = "ui")]
pub use server::UiServer;
pub use snapshot::{NodeSnapshot, PipelineSnapshot, SnapshotCache, SnapshotStore};
