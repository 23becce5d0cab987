//! Per-run retry budget.

use serde::{Deserialize, Serialize};

/// Remaining automatic retries for a run.
///
/// Tokens are only ever consumed; [`RetryBudget::reset`] is reserved for an
/// explicit full restart of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    max: u32,
    remaining: u32,
}

impl RetryBudget {
    /// Creates a full budget of `max` retries.
    #[must_use]
    pub fn new(max: u32) -> Self {
        Self {
            max,
            remaining: max,
        }
    }

    /// A budget that never allows a retry.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// Takes one token, returning false if none are left.
    pub fn consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Tokens left.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// The configured maximum.
    #[must_use]
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Restores the full budget.
    pub fn reset(&mut self) {
        self.remaining = self.max;
    }
}
