//! Human-readable job log written to `_log`.

use crate::metadata::{timestamp, Metadata, MetadataFile};
use tracing::warn;

/// Appends timestamped lines to a node's `_log`.
///
/// The first line creates the file, which is what moves the node from queued
/// to running, so that write is acknowledged through the journal.
#[derive(Debug)]
pub struct JobLog {
    metadata: Metadata,
    announced: bool,
}

impl JobLog {
    /// Creates a log for `metadata`; nothing is written yet.
    #[must_use]
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            announced: false,
        }
    }

    /// Appends one line. Failures are logged and swallowed.
    pub fn line(&mut self, message: impl AsRef<str>) {
        let text = format!("[{}] {}\n", timestamp(), message.as_ref());
        if let Err(e) = self.metadata.append(MetadataFile::Log, &text) {
            warn!(fqname = %self.metadata.fqname(), error = %e, "could not append to job log");
            return;
        }
        if !self.announced {
            self.announced = true;
            self.metadata.update_journal(MetadataFile::Log);
        }
    }

    /// Returns true while `_log` is still on disk.
    #[must_use]
    pub fn present(&self) -> bool {
        self.metadata.exists(MetadataFile::Log)
    }
}
