//! Resource usage reported by the kernel.

use crate::sys::{self, RusageWho};
use serde::{Deserialize, Serialize};

/// One `getrusage` reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rusage {
    /// User CPU seconds.
    pub user_time: f64,
    /// System CPU seconds.
    pub system_time: f64,
    /// Peak resident set size in KB.
    pub max_rss_kb: i64,
    /// Page reclaims.
    pub minor_faults: i64,
    /// Page faults requiring I/O.
    pub major_faults: i64,
    /// Block input operations.
    pub in_blocks: i64,
    /// Block output operations.
    pub out_blocks: i64,
    /// Voluntary context switches.
    pub voluntary_switches: i64,
    /// Involuntary context switches.
    pub involuntary_switches: i64,
}

impl Rusage {
    /// Total CPU seconds.
    #[must_use]
    pub fn cpu_seconds(&self) -> f64 {
        self.user_time + self.system_time
    }
}

/// Resource usage of the job monitor and of everything it waited for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RusageInfo {
    /// The monitor process itself.
    #[serde(rename = "self")]
    pub myself: Rusage,
    /// The worker and its descendants.
    pub children: Rusage,
}

impl RusageInfo {
    /// Reads current usage. Missing readings are left zeroed.
    #[must_use]
    pub fn current() -> Self {
        Self {
            myself: sys::rusage(RusageWho::Myself).unwrap_or_default(),
            children: sys::rusage(RusageWho::Children).unwrap_or_default(),
        }
    }

    /// CPU seconds spent by the monitor and its children together.
    #[must_use]
    pub fn cpu_seconds(&self) -> f64 {
        self.myself.cpu_seconds() + self.children.cpu_seconds()
    }
}
