//! `sysinfo`-based process table for hosts without procfs.

use super::{sum_process_tree, IoAmount, ObservedMemory, ProcessSample, ProcessTreeMemory, TreeUsage};
use parking_lot::Mutex;
use std::io;
use sysinfo::System;

/// Reads the process table through `sysinfo`.
pub struct SysinfoProcessTree {
    system: Mutex<System>,
}

impl Default for SysinfoProcessTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProcessTree {
    /// Creates a backend with an empty process cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl std::fmt::Debug for SysinfoProcessTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoProcessTree").finish_non_exhaustive()
    }
}

impl ProcessTreeMemory for SysinfoProcessTree {
    fn sample(&self, root: u32, exclude: &[u32]) -> io::Result<TreeUsage> {
        let mut system = self.system.lock();
        system.refresh_processes();
        let table: Vec<ProcessSample> = system
            .processes()
            .iter()
            .map(|(pid, process)| {
                let disk = process.disk_usage();
                ProcessSample {
                    pid: pid.as_u32(),
                    ppid: process.parent().map_or(0, |p| p.as_u32()),
                    memory: ObservedMemory {
                        rss: process.memory(),
                        vmem: process.virtual_memory(),
                        proc_count: 1,
                        ..ObservedMemory::default()
                    },
                    io: IoAmount {
                        read: disk.total_read_bytes,
                        write: disk.total_written_bytes,
                        ..IoAmount::default()
                    },
                }
            })
            .collect();
        Ok(sum_process_tree(root, &table, exclude))
    }
}
