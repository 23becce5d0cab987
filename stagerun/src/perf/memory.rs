//! Memory and I/O accounting records.

use serde::{Deserialize, Serialize};

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Memory observed for a process tree, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedMemory {
    /// Resident set size.
    pub rss: u64,
    /// Shared resident pages.
    pub shared: u64,
    /// Virtual memory size.
    pub vmem: u64,
    /// Text (code) size.
    pub text: u64,
    /// Data and stack size.
    pub stack: u64,
    /// Number of processes contributing.
    pub proc_count: u32,
}

impl ObservedMemory {
    /// Raises every field to at least the value in `other`.
    ///
    /// Used to keep a high-water mark across samples.
    pub fn increase_to(&mut self, other: &Self) {
        self.rss = self.rss.max(other.rss);
        self.shared = self.shared.max(other.shared);
        self.vmem = self.vmem.max(other.vmem);
        self.text = self.text.max(other.text);
        self.stack = self.stack.max(other.stack);
        self.proc_count = self.proc_count.max(other.proc_count);
    }

    /// Adds another process's usage to this total.
    pub fn add(&mut self, other: &Self) {
        self.rss += other.rss;
        self.shared += other.shared;
        self.vmem += other.vmem;
        self.text += other.text;
        self.stack += other.stack;
        self.proc_count += other.proc_count;
    }

    /// Returns true if nothing was observed.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Resident memory in GB.
    #[must_use]
    pub fn rss_gb(&self) -> f64 {
        self.rss as f64 / GB
    }

    /// Virtual memory in GB.
    #[must_use]
    pub fn vmem_gb(&self) -> f64 {
        self.vmem as f64 / GB
    }
}

/// Cumulative I/O counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoAmount {
    /// Bytes read from storage.
    pub read: u64,
    /// Bytes written to storage.
    pub write: u64,
    /// Read syscalls.
    pub syscr: u64,
    /// Write syscalls.
    pub syscw: u64,
}

impl IoAmount {
    /// Adds another process's counters to this total.
    pub fn add(&mut self, other: &Self) {
        self.read += other.read;
        self.write += other.write;
        self.syscr += other.syscr;
        self.syscw += other.syscw;
    }

    /// Raises every counter to at least the value in `other`.
    ///
    /// Counters of exited processes disappear from later samples, so the
    /// reported total is the maximum seen.
    pub fn increase_to(&mut self, other: &Self) {
        self.read = self.read.max(other.read);
        self.write = self.write.max(other.write);
        self.syscr = self.syscr.max(other.syscr);
        self.syscw = self.syscw.max(other.syscw);
    }
}

/// I/O statistics recorded in `_jobinfo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IoStats {
    /// Totals over the job's lifetime.
    pub total: IoAmount,
    /// Average read rate in bytes per second.
    #[serde(default)]
    pub read_rate: f64,
    /// Average write rate in bytes per second.
    #[serde(default)]
    pub write_rate: f64,
}

impl IoStats {
    /// Builds statistics from totals and the job's duration.
    #[must_use]
    pub fn from_total(total: IoAmount, seconds: f64) -> Self {
        let rate = |bytes: u64| {
            if seconds > 0.0 {
                bytes as f64 / seconds
            } else {
                0.0
            }
        };
        Self {
            total,
            read_rate: rate(total.read),
            write_rate: rate(total.write),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increase_to_keeps_high_water_mark() {
        let mut peak = ObservedMemory {
            rss: 100,
            vmem: 500,
            proc_count: 1,
            ..ObservedMemory::default()
        };
        peak.increase_to(&ObservedMemory {
            rss: 50,
            vmem: 900,
            proc_count: 3,
            ..ObservedMemory::default()
        });
        assert_eq!(peak.rss, 100);
        assert_eq!(peak.vmem, 900);
        assert_eq!(peak.proc_count, 3);
    }

    #[test]
    fn test_add_and_is_zero() {
        let mut total = ObservedMemory::default();
        assert!(total.is_zero());
        total.add(&ObservedMemory {
            rss: 1 << 30,
            proc_count: 1,
            ..ObservedMemory::default()
        });
        assert!(!total.is_zero());
        assert!((total.rss_gb() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_io_rates() {
        let stats = IoStats::from_total(
            IoAmount {
                read: 1000,
                write: 500,
                ..IoAmount::default()
            },
            10.0,
        );
        assert!((stats.read_rate - 100.0).abs() < f64::EPSILON);
        assert!((stats.write_rate - 50.0).abs() < f64::EPSILON);
        assert_eq!(IoStats::from_total(IoAmount::default(), 0.0).read_rate, 0.0);
    }
}
