//! Volatile data removal.
//!
//! Outputs are reference-counted against the consumers still pending in the
//! call graph. An output whose count reaches zero, that is not a final
//! output, and whose producer is volatile becomes deletable; the policy
//! decides when deletion happens.

use crate::core::JobState;
use crate::errors::ConfigError;
use crate::metadata::{timestamp, MetadataFile};
use crate::node::{Node, NodeTree};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// When outputs are reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VdrPolicy {
    /// Never.
    Disable,
    /// Once, after the whole run completed.
    Post,
    /// As soon as the last consumer of an output completes.
    #[default]
    Rolling,
    /// Like rolling, for every producer, including chunk working directories.
    Strict,
}

impl VdrPolicy {
    fn is_rolling(self) -> bool {
        matches!(self, Self::Rolling | Self::Strict)
    }
}

impl FromStr for VdrPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "post" => Ok(Self::Post),
            "rolling" => Ok(Self::Rolling),
            "strict" => Ok(Self::Strict),
            other => Err(ConfigError::invalid_value(
                "MRO_VDRMODE",
                format!("unknown VDR mode '{other}'"),
            )),
        }
    }
}

/// What one or more deletions reclaimed, stored in `_vdrkill`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VdrKillReport {
    /// Files removed.
    pub count: u64,
    /// Bytes removed.
    pub size: u64,
    /// When the last deletion happened.
    pub timestamp: String,
    /// Paths removed.
    pub paths: Vec<PathBuf>,
    /// Deletion errors; these never fail the run.
    pub errors: Vec<String>,
}

impl VdrKillReport {
    /// Adds `other` into this report.
    pub fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.size += other.size;
        self.paths.extend(other.paths.iter().cloned());
        self.errors.extend(other.errors.iter().cloned());
        if other.timestamp > self.timestamp {
            self.timestamp.clone_from(&other.timestamp);
        }
    }

    /// Returns true if nothing was removed or attempted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.paths.is_empty() && self.errors.is_empty()
    }
}

type OutputKey = (String, String);

/// Reference counts of outputs against pending consumers.
///
/// Only the supervisor loop touches the collector.
#[derive(Debug)]
pub struct VdrCollector {
    policy: VdrPolicy,
    pending: HashMap<OutputKey, BTreeSet<String>>,
    final_outputs: HashSet<OutputKey>,
    released: HashSet<OutputKey>,
    chunks_released: HashSet<String>,
}

impl VdrCollector {
    /// Builds the reference counts from the graph and what already completed.
    #[must_use]
    pub fn new(policy: VdrPolicy, tree: &NodeTree) -> Self {
        let mut pending: HashMap<OutputKey, BTreeSet<String>> = HashMap::new();
        let mut final_outputs = HashSet::new();
        for node in tree.nodes() {
            for output in &node.spec().outputs {
                let key = (node.fqname().to_string(), output.name.clone());
                if output.is_final {
                    final_outputs.insert(key.clone());
                }
                pending.entry(key).or_default();
            }
        }
        for node in tree.nodes() {
            if node.state().is_satisfied() {
                continue;
            }
            for binding in &node.spec().bindings {
                pending
                    .entry((binding.source.clone(), binding.output.clone()))
                    .or_default()
                    .insert(node.fqname().to_string());
            }
        }
        Self {
            policy,
            pending,
            final_outputs,
            released: HashSet::new(),
            chunks_released: HashSet::new(),
        }
    }

    /// The active policy.
    #[must_use]
    pub fn policy(&self) -> VdrPolicy {
        self.policy
    }

    /// Consumers that still need `producer`'s `output`.
    #[must_use]
    pub fn pending_consumers(&self, producer: &str, output: &str) -> Vec<String> {
        self.pending
            .get(&(producer.to_string(), output.to_string()))
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops `fqname` from every count and, under a rolling policy, deletes
    /// the outputs that became unreferenced.
    pub fn on_node_complete(&mut self, fqname: &str, tree: &NodeTree) -> VdrKillReport {
        let mut candidates: BTreeSet<OutputKey> = BTreeSet::new();
        for (key, consumers) in &mut self.pending {
            if consumers.remove(fqname) || key.0 == fqname {
                candidates.insert(key.clone());
            }
        }
        if !self.policy.is_rolling() {
            return VdrKillReport::default();
        }
        self.collect(candidates, tree)
    }

    /// Sweeps every unreferenced output once the run is over.
    pub fn post_run(&mut self, tree: &NodeTree) -> VdrKillReport {
        if self.policy == VdrPolicy::Disable {
            return VdrKillReport::default();
        }
        let candidates = self.pending.keys().cloned().collect();
        self.collect(candidates, tree)
    }

    fn eligible(&self, key: &OutputKey, producer: &Node) -> bool {
        self.policy != VdrPolicy::Disable
            && producer.state() == JobState::Complete
            && (producer.spec().modifiers.volatile || self.policy == VdrPolicy::Strict)
            && !self.final_outputs.contains(key)
            && !self.released.contains(key)
            && self.pending.get(key).map_or(true, BTreeSet::is_empty)
    }

    fn collect(&mut self, candidates: BTreeSet<OutputKey>, tree: &NodeTree) -> VdrKillReport {
        let mut by_producer: HashMap<String, VdrKillReport> = HashMap::new();
        for key in candidates {
            let Some(producer) = tree.node(&key.0) else { continue };
            if !self.eligible(&key, producer) {
                continue;
            }
            self.released.insert(key.clone());
            let path = output_path(producer, &key.1);
            let report = remove_output(producer.metadata().path(), &path);
            by_producer.entry(key.0.clone()).or_default().merge(&report);
        }

        if self.policy == VdrPolicy::Strict {
            for node in tree.nodes() {
                let name = node.fqname();
                if !node.spec().split
                    || node.state() != JobState::Complete
                    || self.chunks_released.contains(name)
                    || !self.fully_consumed(name)
                {
                    continue;
                }
                self.chunks_released.insert(name.to_string());
                let entry = by_producer.entry(name.to_string()).or_default();
                for dir in node.chunk_files_paths() {
                    entry.merge(&remove_output(node.metadata().path(), &dir));
                }
            }
        }

        let mut total = VdrKillReport::default();
        for (fqname, report) in by_producer {
            if report.is_empty() {
                continue;
            }
            if let Some(node) = tree.node(&fqname) {
                record_report(node, &report);
            }
            info!(
                fqname = %fqname,
                count = report.count,
                size = report.size,
                "volatile data removed"
            );
            total.merge(&report);
        }
        total
    }

    fn fully_consumed(&self, producer: &str) -> bool {
        self.pending
            .iter()
            .filter(|(key, _)| key.0 == producer)
            .all(|(key, consumers)| consumers.is_empty() && !self.final_outputs.contains(key))
    }
}

/// Where `producer` keeps `output`.
///
/// A string output value pointing inside the node directory wins; otherwise
/// the output is looked up by name in the node's files directory.
fn output_path(producer: &Node, output: &str) -> PathBuf {
    let node_dir = producer.metadata().path();
    producer
        .outs()
        .and_then(|outs| outs.get(output))
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .filter(|p| p.starts_with(node_dir))
        .unwrap_or_else(|| producer.metadata().files_path().join(output))
}

fn crosses_symlink(node_dir: &Path, path: &Path) -> io::Result<bool> {
    let mut current = Some(path);
    while let Some(p) = current {
        if !p.starts_with(node_dir) {
            break;
        }
        match fs::symlink_metadata(p) {
            Ok(md) if md.file_type().is_symlink() => return Ok(true),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        if p == node_dir {
            break;
        }
        current = p.parent();
    }
    Ok(false)
}

fn tree_usage(path: &Path) -> (u64, u64) {
    let Ok(md) = fs::symlink_metadata(path) else {
        return (0, 0);
    };
    if !md.is_dir() {
        return (1, md.len());
    }
    let mut count = 0;
    let mut size = 0;
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            let (c, s) = tree_usage(&entry.path());
            count += c;
            size += s;
        }
    }
    (count, size)
}

fn remove_output(node_dir: &Path, path: &Path) -> VdrKillReport {
    let mut report = VdrKillReport {
        timestamp: timestamp(),
        ..VdrKillReport::default()
    };
    match crosses_symlink(node_dir, path) {
        Ok(false) => {}
        Ok(true) => {
            warn!(path = %path.display(), "refusing to remove volatile data through a symlink");
            report
                .errors
                .push(format!("{}: path crosses a symlink", path.display()));
            return report;
        }
        Err(e) => {
            report.errors.push(format!("{}: {e}", path.display()));
            return report;
        }
    }
    let Ok(md) = fs::symlink_metadata(path) else {
        debug!(path = %path.display(), "volatile output already gone");
        return report;
    };
    let (count, size) = tree_usage(path);
    let result = if md.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => {
            report.count = count;
            report.size = size;
            report.paths.push(path.to_path_buf());
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not remove volatile data");
            report.errors.push(format!("{}: {e}", path.display()));
        }
    }
    report
}

fn record_report(node: &Node, report: &VdrKillReport) {
    let meta = node.metadata();
    let mut merged: VdrKillReport = meta.read_into(MetadataFile::VdrKill).unwrap_or_default();
    merged.merge(report);
    if let Err(e) = meta.write(MetadataFile::VdrKill, &merged) {
        warn!(fqname = %node.fqname(), error = %e, "could not record vdr report");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobmanager::JobMode;
    use crate::node::{CallGraph, Modifiers, NodeSpec};
    use crate::testing::{Outcome, RunFixture, ScriptedJobManager};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn volatile() -> Modifiers {
        Modifiers {
            volatile: true,
            ..Modifiers::default()
        }
    }

    /// A produces `out.txt`; B and C consume it.
    fn fan_out(a_modifiers: Modifiers, is_final: bool) -> CallGraph {
        let cmd = || vec!["/bin/true".to_string()];
        CallGraph::new("p")
            .with_node(
                NodeSpec::stage("p.A", cmd())
                    .with_modifiers(a_modifiers)
                    .with_output("out.txt", is_final),
            )
            .with_node(NodeSpec::stage("p.B", cmd()).with_binding("p.A", "out.txt"))
            .with_node(NodeSpec::stage("p.C", cmd()).with_binding("p.A", "out.txt"))
            .with_node(NodeSpec::pipeline("p", vec!["p.A".into(), "p.B".into(), "p.C".into()]))
    }

    fn make_output(dir: &TempDir) -> PathBuf {
        let files = dir.path().join("p/A/chnk0/files");
        fs::create_dir_all(&files).unwrap();
        let path = files.join("out.txt");
        fs::write(&path, b"0123456789").unwrap();
        path
    }

    fn drive(run: &mut RunFixture, jm: &ScriptedJobManager, vdr: &mut VdrCollector, cycles: usize) {
        for _ in 0..cycles {
            for change in run.cycle(jm) {
                if change.to == JobState::Complete {
                    vdr.on_node_complete(&change.fqname, &run.tree);
                }
            }
        }
    }

    fn finish_hanging_chunk(run: &RunFixture, fqname: &str) {
        let chunk = run.tree.node(fqname).unwrap().chunks()[0].clone();
        chunk.write(MetadataFile::Outs, &json!({})).unwrap();
        chunk.write_time(MetadataFile::Complete).unwrap();
        chunk.update_journal(MetadataFile::Complete);
    }

    fn setup(policy: VdrPolicy, modifiers: Modifiers) -> (TempDir, RunFixture, ScriptedJobManager, VdrCollector, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = make_output(&dir);
        let jm = ScriptedJobManager::new()
            .with("p.A", JobMode::Main, Outcome::Complete(json!({"out.txt": path.clone()})))
            .with("p.C", JobMode::Main, Outcome::Hang);
        let run = RunFixture::new(&fan_out(modifiers, false), dir.path()).unwrap();
        let vdr = VdrCollector::new(policy, &run.tree);
        (dir, run, jm, vdr, path)
    }

    #[test]
    fn test_rolling_waits_for_every_consumer() {
        let (_dir, mut run, jm, mut vdr, path) = setup(VdrPolicy::Rolling, volatile());
        drive(&mut run, &jm, &mut vdr, 8);
        assert_eq!(run.tree.node("p.B").unwrap().state(), JobState::Complete);
        assert_eq!(run.tree.node("p.C").unwrap().state(), JobState::Running);
        assert!(path.exists());
        assert_eq!(vdr.pending_consumers("p.A", "out.txt"), vec!["p.C".to_string()]);

        finish_hanging_chunk(&run, "p.C");
        drive(&mut run, &jm, &mut vdr, 4);
        assert_eq!(run.tree.node("p.C").unwrap().state(), JobState::Complete);
        assert!(!path.exists());

        let report: VdrKillReport = run
            .tree
            .node("p.A")
            .unwrap()
            .metadata()
            .read_into(MetadataFile::VdrKill)
            .unwrap();
        assert_eq!(report.count, 1);
        assert_eq!(report.size, 10);
        assert_eq!(report.paths, vec![path]);
    }

    #[test]
    fn test_non_volatile_output_kept_unless_strict() {
        let (_dir, mut run, jm, mut vdr, path) = setup(VdrPolicy::Rolling, Modifiers::default());
        drive(&mut run, &jm, &mut vdr, 8);
        finish_hanging_chunk(&run, "p.C");
        drive(&mut run, &jm, &mut vdr, 4);
        assert!(path.exists());

        let mut strict = VdrCollector::new(VdrPolicy::Strict, &run.tree);
        let report = strict.post_run(&run.tree);
        assert_eq!(report.count, 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_post_policy_only_sweeps_at_the_end() {
        let (_dir, mut run, jm, mut vdr, path) = setup(VdrPolicy::Post, volatile());
        drive(&mut run, &jm, &mut vdr, 8);
        finish_hanging_chunk(&run, "p.C");
        drive(&mut run, &jm, &mut vdr, 4);
        assert!(path.exists());
        assert_eq!(vdr.post_run(&run.tree).count, 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_disable_and_final_outputs_are_kept() {
        let (_dir, mut run, jm, mut vdr, path) = setup(VdrPolicy::Disable, volatile());
        drive(&mut run, &jm, &mut vdr, 8);
        finish_hanging_chunk(&run, "p.C");
        drive(&mut run, &jm, &mut vdr, 4);
        assert!(vdr.post_run(&run.tree).is_empty());
        assert!(path.exists());

        let graph = fan_out(volatile(), true);
        let mut keep = VdrCollector::new(VdrPolicy::Strict, &RunFixture::new(&graph, run.root()).unwrap().tree);
        assert!(keep.post_run(&run.tree).is_empty());
        assert!(path.exists());
    }

    #[test]
    fn test_refuses_to_follow_symlinks() {
        let dir = TempDir::new().unwrap();
        let node_dir = dir.path().join("p/A");
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("data"), b"keep").unwrap();
        fs::create_dir_all(node_dir.join("chnk0")).unwrap();
        std::os::unix::fs::symlink(&outside, node_dir.join("chnk0/files")).unwrap();

        let report = remove_output(&node_dir, &node_dir.join("chnk0/files/data"));
        assert_eq!(report.count, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(outside.join("data").exists());
    }

    #[test]
    fn test_remove_directory_counts_files() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("p/A/files/bams");
        fs::create_dir_all(out.join("sub")).unwrap();
        fs::write(out.join("a.bam"), b"aaaa").unwrap();
        fs::write(out.join("sub/b.bam"), b"bb").unwrap();

        let report = remove_output(&dir.path().join("p/A"), &out);
        assert_eq!((report.count, report.size), (2, 6));
        assert!(!out.exists());
    }

    #[test]
    fn test_report_merge() {
        let mut a = VdrKillReport {
            count: 1,
            size: 10,
            timestamp: "2024-01-01 00:00:00".into(),
            paths: vec!["/a".into()],
            errors: vec![],
        };
        let b = VdrKillReport {
            count: 2,
            size: 5,
            timestamp: "2024-01-02 00:00:00".into(),
            paths: vec!["/b".into()],
            errors: vec!["x".into()],
        };
        a.merge(&b);
        assert_eq!((a.count, a.size), (3, 15));
        assert_eq!(a.timestamp, "2024-01-02 00:00:00");
        assert_eq!(a.paths.len(), 2);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("Strict".parse::<VdrPolicy>().unwrap(), VdrPolicy::Strict);
        assert_eq!("disable".parse::<VdrPolicy>().unwrap(), VdrPolicy::Disable);
        assert!("sometimes".parse::<VdrPolicy>().is_err());
    }
}
