//! Memory and CPU-thread quotas of a job attempt.

use crate::jobinfo::JobInfo;
use crate::perf::ObservedMemory;
use serde::{Deserialize, Serialize};

pub(crate) const GB: u64 = 1024 * 1024 * 1024;

/// Memory reserved for a job, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryQuota {
    /// Resident memory limit; zero means unlimited.
    pub rss: u64,
    /// Virtual memory limit; zero means unlimited.
    pub vmem: u64,
}

impl MemoryQuota {
    /// The reservation recorded in `_jobinfo`.
    #[must_use]
    pub fn from_jobinfo(info: &JobInfo) -> Self {
        Self {
            rss: u64::from(info.mem_gb) * GB,
            vmem: u64::from(info.vmem_gb) * GB,
        }
    }

    /// Describes the first limit `usage` exceeds.
    #[must_use]
    pub fn check(&self, usage: &ObservedMemory) -> Option<String> {
        if self.rss > 0 && usage.rss > self.rss {
            return Some(format!(
                "Job exceeded memory quota: {:.2} GB in use, {:.2} GB reserved",
                usage.rss_gb(),
                gb(self.rss)
            ));
        }
        if self.vmem > 0 && usage.vmem > self.vmem {
            return Some(format!(
                "Job exceeded virtual memory quota: {:.2} GB in use, {:.2} GB reserved",
                usage.vmem_gb(),
                gb(self.vmem)
            ));
        }
        None
    }
}

fn gb(bytes: u64) -> f64 {
    bytes as f64 / GB as f64
}

/// Retroactive check that a job stayed near its thread reservation.
///
/// A job that ran at least `min_seconds` and used more than
/// `factor * threads * wall_seconds` CPU-seconds is judged to have ignored
/// its reservation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadQuota {
    /// Whether the check runs at all.
    pub enabled: bool,
    /// Allowed overshoot over the reservation.
    pub factor: f64,
    /// Jobs shorter than this are never judged.
    pub min_seconds: f64,
}

impl Default for ThreadQuota {
    fn default() -> Self {
        Self {
            enabled: true,
            factor: 1.5,
            min_seconds: 900.0,
        }
    }
}

impl ThreadQuota {
    /// Describes the overshoot, if any.
    #[must_use]
    pub fn check(&self, cpu_seconds: f64, wall_seconds: f64, threads: u32) -> Option<String> {
        if !self.enabled || threads == 0 || wall_seconds < self.min_seconds {
            return None;
        }
        let allowed = self.factor * f64::from(threads) * wall_seconds;
        (cpu_seconds > allowed).then(|| {
            format!(
                "Job exceeded thread quota: {cpu_seconds:.0} CPU-seconds in {wall_seconds:.0} seconds \
                 ({:.1} threads on average) with {threads} reserved",
                cpu_seconds / wall_seconds
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_quota() {
        let info = JobInfo::new("p.S", "local").with_resources(1, 2, 0);
        let quota = MemoryQuota::from_jobinfo(&info);
        let under = ObservedMemory {
            rss: GB,
            vmem: 100 * GB,
            ..ObservedMemory::default()
        };
        assert_eq!(quota.check(&under), None);

        let over = ObservedMemory {
            rss: 3 * GB,
            ..ObservedMemory::default()
        };
        let message = quota.check(&over).unwrap();
        assert!(message.starts_with("Job exceeded memory quota: 3.00 GB in use"));
    }

    #[test]
    fn test_vmem_quota() {
        let quota = MemoryQuota {
            rss: 0,
            vmem: 4 * GB,
        };
        let usage = ObservedMemory {
            rss: 100 * GB,
            vmem: 5 * GB,
            ..ObservedMemory::default()
        };
        assert!(quota.check(&usage).unwrap().contains("virtual memory"));
    }

    #[test]
    fn test_thread_quota() {
        let quota = ThreadQuota::default();
        assert_eq!(quota.check(10_000.0, 100.0, 1), None);
        assert_eq!(quota.check(1400.0, 1000.0, 1), None);
        assert!(quota.check(1600.0, 1000.0, 1).is_some());
        assert_eq!(quota.check(2900.0, 1000.0, 2), None);

        let disabled = ThreadQuota {
            enabled: false,
            ..ThreadQuota::default()
        };
        assert_eq!(disabled.check(1e9, 1000.0, 1), None);
    }
}
