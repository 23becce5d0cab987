//! Process-tree resource sampling.
//!
//! The job monitor needs the memory and I/O of a worker together with every
//! process it spawned. Platforms expose a flat process table; the tree walk
//! over it ([`sum_process_tree`]) is shared and backends only produce
//! [`ProcessSample`] rows:
//! - [`ProcfsProcessTree`] reads `/proc` directly
//! - [`SysinfoProcessTree`] goes through `sysinfo` where `/proc` is absent

mod memory;
mod procfs;
mod rusage;
mod sysinfo_tree;

pub use memory::{IoAmount, IoStats, ObservedMemory};
pub use procfs::ProcfsProcessTree;
pub use rusage::{Rusage, RusageInfo};
pub use sysinfo_tree::SysinfoProcessTree;

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::Path;
use std::sync::Arc;

/// One row of a process table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSample {
    /// Process id.
    pub pid: u32,
    /// Parent process id.
    pub ppid: u32,
    /// Memory of this process alone.
    pub memory: ObservedMemory,
    /// I/O counters of this process alone.
    pub io: IoAmount,
}

/// Usage summed over a process tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeUsage {
    /// Summed memory; `proc_count` is the number of processes visited.
    pub memory: ObservedMemory,
    /// Summed I/O counters.
    pub io: IoAmount,
}

/// Capability to measure a running process tree.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessTreeMemory: Send + Sync {
    /// Samples `root` and its descendants, skipping `exclude` and their subtrees.
    fn sample(&self, root: u32, exclude: &[u32]) -> io::Result<TreeUsage>;
}

/// Sums usage over `root` and its descendants in a flat process table.
///
/// Each pid is counted once even if the table repeats it or contains a
/// parent cycle. Excluded pids (for example a profiler attached to the
/// worker) are skipped together with their subtrees. A root missing from
/// the table yields an empty total.
#[must_use]
pub fn sum_process_tree(root: u32, table: &[ProcessSample], exclude: &[u32]) -> TreeUsage {
    let mut by_pid: HashMap<u32, &ProcessSample> = HashMap::with_capacity(table.len());
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for row in table {
        if by_pid.insert(row.pid, row).is_none() && row.pid != row.ppid {
            children.entry(row.ppid).or_default().push(row.pid);
        }
    }

    let excluded: HashSet<u32> = exclude.iter().copied().collect();
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([root]);
    let mut total = TreeUsage::default();

    while let Some(pid) = queue.pop_front() {
        if excluded.contains(&pid) || !visited.insert(pid) {
            continue;
        }
        let Some(row) = by_pid.get(&pid) else {
            continue;
        };
        let mut memory = row.memory;
        memory.proc_count = 1;
        total.memory.add(&memory);
        total.io.add(&row.io);
        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().copied());
        }
    }
    total
}

/// Picks the best backend for this host.
#[must_use]
pub fn default_process_tree() -> Arc<dyn ProcessTreeMemory> {
    if Path::new("/proc/self/statm").exists() {
        Arc::new(ProcfsProcessTree::new())
    } else {
        Arc::new(SysinfoProcessTree::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pid: u32, ppid: u32, rss: u64) -> ProcessSample {
        ProcessSample {
            pid,
            ppid,
            memory: ObservedMemory {
                rss,
                vmem: rss * 2,
                ..ObservedMemory::default()
            },
            io: IoAmount {
                read: rss / 10,
                ..IoAmount::default()
            },
        }
    }

    fn synthetic_tree() -> Vec<ProcessSample> {
        // 1 ─┬─ 100 (worker) ─┬─ 101 ── 103
        //    │                └─ 102 (profiler)
        //    └─ 200 (unrelated)
        vec![
            row(1, 0, 5),
            row(100, 1, 1000),
            row(101, 100, 200),
            row(102, 100, 7000),
            row(103, 101, 30),
            row(200, 1, 9000),
        ]
    }

    #[test]
    fn test_sums_whole_subtree() {
        let usage = sum_process_tree(100, &synthetic_tree(), &[]);
        assert_eq!(usage.memory.rss, 1000 + 200 + 7000 + 30);
        assert_eq!(usage.memory.vmem, 2 * (1000 + 200 + 7000 + 30));
        assert_eq!(usage.memory.proc_count, 4);
        assert_eq!(usage.io.read, 100 + 20 + 700 + 3);
    }

    #[test]
    fn test_excludes_profiler_subtree() {
        let usage = sum_process_tree(100, &synthetic_tree(), &[102]);
        assert_eq!(usage.memory.rss, 1230);
        assert_eq!(usage.memory.proc_count, 3);
    }

    #[test]
    fn test_duplicate_rows_counted_once() {
        let mut table = synthetic_tree();
        table.push(row(101, 100, 200));
        let usage = sum_process_tree(100, &table, &[]);
        assert_eq!(usage.memory.proc_count, 4);
    }

    #[test]
    fn test_parent_cycle_terminates() {
        let table = vec![row(10, 11, 1), row(11, 10, 2)];
        let usage = sum_process_tree(10, &table, &[]);
        assert_eq!(usage.memory.rss, 3);
        assert_eq!(usage.memory.proc_count, 2);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let usage = sum_process_tree(4242, &synthetic_tree(), &[]);
        assert_eq!(usage, TreeUsage::default());
    }

    #[test]
    fn test_default_backend_samples_self() {
        let tree = default_process_tree();
        let usage = tree.sample(std::process::id(), &[]).unwrap();
        assert!(usage.memory.rss > 0);
        assert!(usage.memory.proc_count >= 1);
    }
}
