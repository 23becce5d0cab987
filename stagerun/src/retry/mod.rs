//! Automatic retry of transient execution failures.
//!
//! - [`RetryClassifier`] decides whether a failed node's error looks transient
//! - [`RetryBudget`] bounds how many automatic retries a run may use
//! - [`SubmitRetryConfig`] governs the job manager's own retries of failed
//!   cluster submissions, which do not draw on the budget

mod backoff;
mod budget;
mod classifier;

pub use backoff::{with_retry, BackoffStrategy, JitterStrategy, RetryDecision, RetryState, SubmitRetryConfig};
pub use budget::RetryBudget;
pub use classifier::{Classification, FailureReport, RetryClassifier, DEFAULT_TRANSIENT_PATTERNS};
