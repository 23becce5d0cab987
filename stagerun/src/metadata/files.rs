//! The fixed vocabulary of metadata file names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix prepended to every metadata file name on disk.
pub const METADATA_PREFIX: &str = "_";

/// One typed metadata file.
///
/// Each variant is a message type in the protocol between the supervisor,
/// the job monitor and the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataFile {
    /// Lines a worker wants surfaced to the user without failing.
    Alarm,
    /// Stage arguments.
    Args,
    /// Assertion text; the job failed and must not be retried.
    Assert,
    /// Chunk definitions passed to join.
    ChunkDefs,
    /// Chunk outputs passed to join.
    ChunkOuts,
    /// Completion timestamp.
    Complete,
    /// The node was switched off.
    Disabled,
    /// Error text; the job failed.
    Errors,
    /// Final pipeline state written at the end of a run.
    FinalState,
    /// Liveness marker, journal only.
    Heartbeat,
    /// The call graph the run was started with.
    Invocation,
    /// Cluster job id.
    JobId,
    /// Resource and runtime accounting.
    JobInfo,
    /// Job mode the run uses.
    JobMode,
    /// Rendered cluster submission script.
    JobScript,
    /// Job monitor log.
    Log,
    /// Stage outputs.
    Outs,
    /// Aggregated performance data.
    Perf,
    /// Latest progress message.
    Progress,
    /// Marker for a local job waiting for its reservation.
    QueuedLocally,
    /// Split output: the chunk definitions.
    StageDefs,
    /// Worker standard error.
    Stderr,
    /// Worker standard output.
    Stdout,
    /// VDR kill report.
    VdrKill,
}

impl MetadataFile {
    /// Every metadata file, in name order.
    pub const ALL: [Self; 24] = [
        Self::Alarm,
        Self::Args,
        Self::Assert,
        Self::ChunkDefs,
        Self::ChunkOuts,
        Self::Complete,
        Self::Disabled,
        Self::Errors,
        Self::FinalState,
        Self::Heartbeat,
        Self::Invocation,
        Self::JobId,
        Self::JobInfo,
        Self::JobMode,
        Self::JobScript,
        Self::Log,
        Self::Outs,
        Self::Perf,
        Self::Progress,
        Self::QueuedLocally,
        Self::StageDefs,
        Self::Stderr,
        Self::Stdout,
        Self::VdrKill,
    ];

    /// The bare name, without the `_` prefix.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Alarm => "alarm",
            Self::Args => "args",
            Self::Assert => "assert",
            Self::ChunkDefs => "chunk_defs",
            Self::ChunkOuts => "chunk_outs",
            Self::Complete => "complete",
            Self::Disabled => "disabled",
            Self::Errors => "errors",
            Self::FinalState => "finalstate",
            Self::Heartbeat => "heartbeat",
            Self::Invocation => "invocation",
            Self::JobId => "jobid",
            Self::JobInfo => "jobinfo",
            Self::JobMode => "jobmode",
            Self::JobScript => "jobscript",
            Self::Log => "log",
            Self::Outs => "outs",
            Self::Perf => "perf",
            Self::Progress => "progress",
            Self::QueuedLocally => "queued_locally",
            Self::StageDefs => "stage_defs",
            Self::Stderr => "stderr",
            Self::Stdout => "stdout",
            Self::VdrKill => "vdrkill",
        }
    }

    /// The on-disk file name, with the prefix.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{METADATA_PREFIX}{}", self.as_str())
    }

    /// Parses an on-disk file name such as `_outs`.
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        name.strip_prefix(METADATA_PREFIX)
            .and_then(|bare| bare.parse().ok())
    }
}

impl fmt::Display for MetadataFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetadataFile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown metadata file '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_has_prefix() {
        assert_eq!(MetadataFile::JobInfo.file_name(), "_jobinfo");
        assert_eq!(MetadataFile::StageDefs.file_name(), "_stage_defs");
    }

    #[test]
    fn test_parse_round_trip_for_all() {
        for file in MetadataFile::ALL {
            assert_eq!(MetadataFile::from_file_name(&file.file_name()), Some(file));
        }
    }

    #[test]
    fn test_parse_rejects_unknown_and_tmp() {
        assert_eq!(MetadataFile::from_file_name("_outs.tmp"), None);
        assert_eq!(MetadataFile::from_file_name("outs"), None);
        assert!("bogus".parse::<MetadataFile>().is_err());
    }
}
