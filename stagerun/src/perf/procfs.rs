//! `/proc`-based process table.

use super::{sum_process_tree, IoAmount, ObservedMemory, ProcessSample, ProcessTreeMemory, TreeUsage};
use crate::sys;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Reads the process table from a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcfsProcessTree {
    root: PathBuf,
    page_size: u64,
}

impl Default for ProcfsProcessTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsProcessTree {
    /// Uses `/proc`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root("/proc", sys::page_size())
    }

    /// Uses an alternative procfs root.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>, page_size: u64) -> Self {
        Self {
            root: root.into(),
            page_size,
        }
    }

    /// Reads every process visible under the root.
    pub fn table(&self) -> io::Result<Vec<ProcessSample>> {
        let mut table = Vec::new();
        for entry in fs::read_dir(&self.root)?.filter_map(Result::ok) {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes exit between the listing and the read.
            if let Some(sample) = self.read_process(pid, &entry.path()) {
                table.push(sample);
            }
        }
        Ok(table)
    }

    fn read_process(&self, pid: u32, dir: &Path) -> Option<ProcessSample> {
        let stat = fs::read_to_string(dir.join("stat")).ok()?;
        let ppid = parse_ppid(&stat)?;
        let memory = fs::read_to_string(dir.join("statm"))
            .ok()
            .and_then(|s| parse_statm(&s, self.page_size))
            .unwrap_or_default();
        let io = fs::read_to_string(dir.join("io"))
            .ok()
            .map(|s| parse_io(&s))
            .unwrap_or_default();
        Some(ProcessSample {
            pid,
            ppid,
            memory,
            io,
        })
    }
}

impl ProcessTreeMemory for ProcfsProcessTree {
    fn sample(&self, root: u32, exclude: &[u32]) -> io::Result<TreeUsage> {
        Ok(sum_process_tree(root, &self.table()?, exclude))
    }
}

/// Parent pid from `/proc/<pid>/stat`; the command name may contain spaces
/// and parentheses, so fields are counted after the last `)`.
fn parse_ppid(stat: &str) -> Option<u32> {
    let after = &stat[stat.rfind(')')? + 1..];
    after.split_whitespace().nth(1)?.parse().ok()
}

/// `size resident shared text lib data dt`, in pages.
fn parse_statm(statm: &str, page_size: u64) -> Option<ObservedMemory> {
    let fields: Vec<u64> = statm
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() < 6 {
        return None;
    }
    Some(ObservedMemory {
        vmem: fields[0] * page_size,
        rss: fields[1] * page_size,
        shared: fields[2] * page_size,
        text: fields[3] * page_size,
        stack: fields[5] * page_size,
        proc_count: 1,
    })
}

fn parse_io(io: &str) -> IoAmount {
    let mut amount = IoAmount::default();
    for line in io.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };
        match key.trim() {
            "read_bytes" => amount.read = value,
            "write_bytes" => amount.write = value,
            "syscr" => amount.syscr = value,
            "syscw" => amount.syscw = value,
            _ => {}
        }
    }
    amount
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_proc(root: &Path, pid: u32, ppid: u32, resident_pages: u64) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("stat"),
            format!("{pid} (my (odd) cmd) S {ppid} {pid} {pid} 0 -1 4194304"),
        )
        .unwrap();
        fs::write(
            dir.join("statm"),
            format!("{} {resident_pages} 2 1 0 3 0\n", resident_pages * 4),
        )
        .unwrap();
        fs::write(
            dir.join("io"),
            "rchar: 999\nwchar: 888\nsyscr: 7\nsyscw: 6\nread_bytes: 4096\nwrite_bytes: 8192\n",
        )
        .unwrap();
    }

    #[test]
    fn test_parse_ppid_with_parens_in_name() {
        assert_eq!(parse_ppid("42 (a) b) R 17 42 42"), Some(17));
        assert_eq!(parse_ppid("garbage"), None);
    }

    #[test]
    fn test_parse_statm() {
        let mem = parse_statm("100 50 10 5 0 20 0", 4096).unwrap();
        assert_eq!(mem.vmem, 100 * 4096);
        assert_eq!(mem.rss, 50 * 4096);
        assert_eq!(mem.stack, 20 * 4096);
        assert!(parse_statm("1 2", 4096).is_none());
    }

    #[test]
    fn test_sample_fake_tree() {
        let dir = TempDir::new().unwrap();
        fake_proc(dir.path(), 10, 1, 100);
        fake_proc(dir.path(), 11, 10, 50);
        fake_proc(dir.path(), 12, 11, 25);
        fake_proc(dir.path(), 13, 1, 1000);
        fs::create_dir_all(dir.path().join("self")).unwrap();

        let tree = ProcfsProcessTree::with_root(dir.path(), 4096);
        let usage = tree.sample(10, &[]).unwrap();
        assert_eq!(usage.memory.rss, 175 * 4096);
        assert_eq!(usage.memory.proc_count, 3);
        assert_eq!(usage.io.read, 3 * 4096);
        assert_eq!(usage.io.syscw, 18);
    }
}
