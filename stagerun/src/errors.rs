//! Error types for the stagerun engine.
//!
//! The taxonomy follows how failures propagate through a run:
//!
//! - [`MetadataError`]: infrastructure failures reading or writing node state.
//!   Best-effort everywhere except the essential `_jobinfo` read at job start.
//! - [`ResourceExceededError`]: a job asks for more than the configured maximum.
//!   Fatal for that node and never retried.
//! - [`JobManagerError`]: admission and submission failures.
//! - [`MonitorError`]: failures of a single job attempt's supervisor.
//! - [`ConfigError`] and [`GraphError`]: problems with the inputs of a run.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for stagerun operations.
#[derive(Debug, Error)]
pub enum StagerunError {
    /// A metadata store error.
    #[error("{0}")]
    Metadata(#[from] MetadataError),

    /// A job manager error.
    #[error("{0}")]
    JobManager(#[from] JobManagerError),

    /// A job monitor error.
    #[error("{0}")]
    Monitor(#[from] MonitorError),

    /// A configuration error.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The call graph handed to the engine is malformed.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the metadata store.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The requested metadata file does not exist.
    #[error("metadata file not found: {}", path.display())]
    NotFound {
        /// Path that was read.
        path: PathBuf,
    },

    /// The file exists but its content could not be decoded.
    #[error("malformed metadata file {}: {source}", path.display())]
    Decode {
        /// Path that was read.
        path: PathBuf,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// The payload could not be serialized.
    #[error("could not encode metadata for {}: {source}", path.display())]
    Encode {
        /// Path that was being written.
        path: PathBuf,
        /// Underlying encode error.
        #[source]
        source: serde_json::Error,
    },

    /// An I/O error other than a missing file.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl MetadataError {
    /// Maps an I/O error on `path`, turning `NotFound` into [`MetadataError::NotFound`].
    pub(crate) fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound { path }
        } else {
            Self::Io { path, source }
        }
    }

    /// Returns true if the file was absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Kind of resource named in a [`ResourceExceededError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// CPU threads.
    Threads,
    /// Resident memory, in GB.
    MemoryGb,
    /// Virtual memory, in GB.
    VirtualMemoryGb,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Threads => write!(f, "threads"),
            Self::MemoryGb => write!(f, "GB of memory"),
            Self::VirtualMemoryGb => write!(f, "GB of virtual memory"),
        }
    }
}

/// Error raised when a job requests more than the job manager can ever grant.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Job requested {requested} {resource}, but the job manager allows at most {max}")]
pub struct ResourceExceededError {
    /// Which resource was exceeded.
    pub resource: ResourceKind,
    /// The requested amount.
    pub requested: f64,
    /// The configured maximum.
    pub max: f64,
}

impl ResourceExceededError {
    /// Creates a new resource exceeded error.
    #[must_use]
    pub fn new(resource: ResourceKind, requested: f64, max: f64) -> Self {
        Self {
            resource,
            requested,
            max,
        }
    }
}

/// Errors raised by job managers.
#[derive(Debug, Error)]
pub enum JobManagerError {
    /// The request can never be satisfied.
    #[error("{0}")]
    ResourceExceeded(#[from] ResourceExceededError),

    /// The cluster submission command kept failing.
    #[error("jobcmd error ({message}) after {attempts} attempt(s):\n{output}")]
    Submission {
        /// Number of attempts made.
        attempts: usize,
        /// Short description of the last failure.
        message: String,
        /// Combined output of the last submission call.
        output: String,
    },

    /// The job template could not be rendered.
    #[error("Job template error: {0}")]
    Template(String),

    /// The job process could not be started.
    #[error("Failed to start job: {0}")]
    Spawn(#[source] std::io::Error),

    /// Metadata for the job could not be written.
    #[error("{0}")]
    Metadata(#[from] MetadataError),

    /// The job manager is shutting down.
    #[error("Job manager is shutting down")]
    ShuttingDown,
}

/// Errors raised while supervising a job attempt.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The `_jobinfo` written by the scheduler could not be read.
    #[error("Could not read job info: {0}")]
    JobInfo(#[source] MetadataError),

    /// A metadata write or read failed.
    #[error("{0}")]
    Metadata(#[from] MetadataError),

    /// Process setup failed (working directory, limits, pipes).
    #[error("Job setup failed: {0}")]
    Setup(String),

    /// The worker process could not be started.
    #[error("Failed to start worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file could not be read.
    #[error("could not read {}: {source}", path.display())]
    Read {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A config file could not be parsed.
    #[error("could not parse {}: {source}", path.display())]
    Parse {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A regular expression in the configuration is invalid.
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Underlying error.
        #[source]
        source: regex::Error,
    },

    /// A setting has an unusable value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Setting name.
        key: String,
        /// What is wrong with it.
        message: String,
    },
}

impl ConfigError {
    /// Creates an invalid value error.
    #[must_use]
    pub fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Errors in the call graph handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Two nodes share a fully-qualified name.
    #[error("duplicate node '{0}'")]
    DuplicateNode(String),

    /// A node depends on a node that does not exist.
    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency {
        /// The dependent node.
        node: String,
        /// The missing dependency.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Cycle detected in call graph: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Errors from the state query interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No bearer token was supplied.
    #[error("missing bearer token")]
    Missing,
    /// The supplied token did not match.
    #[error("invalid bearer token")]
    Invalid,
}

/// Result type alias for stagerun operations.
pub type Result<T, E = StagerunError> = std::result::Result<T, E>;
