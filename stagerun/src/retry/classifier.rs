//! Transient-failure classification.

use crate::errors::ConfigError;
use regex::Regex;
use std::path::PathBuf;

/// Error signatures that are retried by default.
pub const DEFAULT_TRANSIENT_PATTERNS: &[&str] = &[
    r"^signal: ",
    r"^No heartbeat detected",
    r"^Job was not found in the queue",
    r"^Local job process \d+ is no longer running",
    r"(?i)\bpreempted\b",
    r"Resource temporarily unavailable",
    r"(?i)stale file handle",
];

const EXCERPT_LINES: usize = 20;

/// Everything known about one failed node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureReport {
    /// Fully-qualified node name.
    pub fqname: String,
    /// True if the failure came from `_assert`.
    pub assert: bool,
    /// Content of `_errors` or `_assert`.
    pub message: String,
    /// Last lines of the job's `_log`.
    pub log_tail: Vec<String>,
    /// Path of the file holding the full error.
    pub error_path: PathBuf,
}

/// Verdict for one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Whether an automatic retry may fix it.
    pub transient: bool,
    /// Lines to show the user; the matched line when transient.
    pub excerpt: String,
}

/// Matches failure text against known transient signatures.
#[derive(Debug, Clone)]
pub struct RetryClassifier {
    patterns: Vec<Regex>,
}

impl RetryClassifier {
    /// Builds a classifier from the default signatures plus `extra` ones.
    pub fn new<S: AsRef<str>>(extra: &[S]) -> Result<Self, ConfigError> {
        let patterns = DEFAULT_TRANSIENT_PATTERNS
            .iter()
            .copied()
            .chain(extra.iter().map(AsRef::as_ref))
            .map(|p| {
                Regex::new(p).map_err(|source| ConfigError::InvalidPattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { patterns })
    }

    /// A classifier with only the default signatures.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            patterns: DEFAULT_TRANSIENT_PATTERNS
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
        }
    }

    /// Decides whether `report` describes a transient failure.
    ///
    /// Assertions are never transient. Otherwise each line of the error, then
    /// of the log tail, is matched; the first hit is returned as the excerpt.
    #[must_use]
    pub fn is_error_transient(&self, report: &FailureReport) -> Classification {
        if !report.assert {
            let lines = report
                .message
                .lines()
                .chain(report.log_tail.iter().map(String::as_str));
            for line in lines {
                let line = line.trim();
                if self.patterns.iter().any(|re| re.is_match(line)) {
                    return Classification {
                        transient: true,
                        excerpt: line.to_string(),
                    };
                }
            }
        }
        Classification {
            transient: false,
            excerpt: excerpt(&report.message),
        }
    }
}

impl Default for RetryClassifier {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn excerpt(message: &str) -> String {
    let mut lines: Vec<&str> = message.lines().take(EXCERPT_LINES + 1).collect();
    if lines.len() > EXCERPT_LINES {
        lines.truncate(EXCERPT_LINES);
        lines.push("...");
    }
    lines.join("\n")
}
