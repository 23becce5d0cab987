//! Journal markers that signal metadata changes.
//!
//! A marker is a zero-length file named `<journal name>.<file>.<seq>` in the
//! run's journal directory. For a given journal name and file there is one
//! writer at a time (the job monitor for job files, the supervisor for node
//! files), and its sequence numbers strictly increase. The writer keeps only
//! its latest marker, so a scanner that remembers the highest sequence it has
//! seen per key detects every change with one directory listing per cycle.

use super::files::MetadataFile;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

const MAX_CREATE_ATTEMPTS: u32 = 1000;

/// A parsed journal marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Journal name of the metadata that changed.
    pub name: String,
    /// The metadata file that changed.
    pub file: MetadataFile,
    /// Sequence number of the change.
    pub seq: u64,
    /// Modification time of the marker, if it could be read.
    pub modified: Option<SystemTime>,
}

impl JournalEntry {
    /// Parses a marker file name.
    #[must_use]
    pub fn parse(file_name: &str) -> Option<(String, MetadataFile, u64)> {
        let (rest, seq) = file_name.rsplit_once('.')?;
        let seq = seq.parse().ok()?;
        let (name, file) = rest.rsplit_once('.')?;
        let file = file.parse().ok()?;
        if name.is_empty() {
            return None;
        }
        Some((name.to_string(), file, seq))
    }
}

fn marker_key(name: &str, file: MetadataFile) -> String {
    format!("{name}.{file}")
}

/// True if `candidate` is `name` or one of its sub-metadata names.
fn within(candidate: &str, name: &str) -> bool {
    candidate
        .strip_prefix(name)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

/// Name of the journal directory inside a run directory.
pub const JOURNAL_DIR: &str = "journal";

/// Writer side of the journal.
#[derive(Debug)]
pub struct Journal {
    dir: PathBuf,
    last_seq: Mutex<HashMap<String, u64>>,
}

impl Journal {
    /// Creates a journal rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_seq: Mutex::new(HashMap::new()),
        }
    }

    /// The journal directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the journal directory.
    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// Records a change to `file` of the metadata named `name`.
    ///
    /// Returns the sequence number of the new marker.
    pub fn record(&self, name: &str, file: MetadataFile) -> io::Result<u64> {
        let key = marker_key(name, file);
        let mut last_seq = self.last_seq.lock();
        let previous = match last_seq.get(&key) {
            Some(seq) => Some(*seq),
            None => self.highest_on_disk(&key)?,
        };
        let mut seq = previous.map_or(1, |p| p + 1);

        for _ in 0..MAX_CREATE_ATTEMPTS {
            let path = self.dir.join(format!("{key}.{seq}"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    last_seq.insert(key.clone(), seq);
                    if let Some(prev) = previous {
                        let _ = fs::remove_file(self.dir.join(format!("{key}.{prev}")));
                    }
                    debug!(marker = %path.display(), "journal updated");
                    return Ok(seq);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => seq += 1,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("could not allocate a journal marker for {key}"),
        ))
    }

    /// Removes every marker belonging to `name`, including sub-metadata.
    pub fn remove_all(&self, name: &str) -> io::Result<usize> {
        let mut removed = 0;
        self.last_seq.lock().retain(|key, _| {
            key.rsplit_once('.')
                .map_or(true, |(owner, _)| !within(owner, name))
        });
        for entry in read_dir_tolerant(&self.dir)? {
            let file_name = entry.file_name();
            let Some((owner, _, _)) = file_name.to_str().and_then(JournalEntry::parse) else {
                continue;
            };
            if within(&owner, name) {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(removed)
    }

    fn highest_on_disk(&self, key: &str) -> io::Result<Option<u64>> {
        let prefix = format!("{key}.");
        let mut highest = None;
        for entry in read_dir_tolerant(&self.dir)? {
            let file_name = entry.file_name();
            let Some(seq) = file_name
                .to_str()
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            highest = Some(highest.map_or(seq, |h: u64| h.max(seq)));
        }
        Ok(highest)
    }
}

fn read_dir_tolerant(dir: &Path) -> io::Result<Vec<fs::DirEntry>> {
    match fs::read_dir(dir) {
        Ok(iter) => Ok(iter.filter_map(Result::ok).collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Reader side of the journal.
#[derive(Debug)]
pub struct JournalScanner {
    dir: PathBuf,
    seen: HashMap<(String, MetadataFile), u64>,
}

impl JournalScanner {
    /// Creates a scanner over `dir` that has seen nothing yet.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seen: HashMap::new(),
        }
    }

    /// Returns markers newer than the last scan, one per changed key.
    pub fn scan(&mut self) -> io::Result<Vec<JournalEntry>> {
        let mut newest: HashMap<(String, MetadataFile), JournalEntry> = HashMap::new();
        for entry in read_dir_tolerant(&self.dir)? {
            let file_name = entry.file_name();
            let Some((name, file, seq)) = file_name.to_str().and_then(JournalEntry::parse) else {
                continue;
            };
            let key = (name, file);
            if self.seen.get(&key).is_some_and(|s| *s >= seq) {
                continue;
            }
            if newest.get(&key).is_some_and(|e| e.seq >= seq) {
                continue;
            }
            let modified = entry.metadata().and_then(|m| m.modified()).ok();
            newest.insert(
                key.clone(),
                JournalEntry {
                    name: key.0,
                    file: key.1,
                    seq,
                    modified,
                },
            );
        }

        let mut changed: Vec<JournalEntry> = newest.into_values().collect();
        for entry in &changed {
            self.seen.insert((entry.name.clone(), entry.file), entry.seq);
        }
        changed.sort_by(|a, b| a.name.cmp(&b.name).then(a.file.cmp(&b.file)));
        Ok(changed)
    }

    /// Forgets everything seen for `name` and its sub-metadata, after a reset.
    pub fn forget(&mut self, name: &str) {
        self.seen.retain(|(n, _), _| !within(n, name));
    }

    /// Highest sequence seen for a key.
    #[must_use]
    pub fn highest_seen(&self, name: &str, file: MetadataFile) -> Option<u64> {
        self.seen.get(&(name.to_string(), file)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_marker_name() {
        let parsed = JournalEntry::parse("pipe.STAGE.chnk0.heartbeat.12").unwrap();
        assert_eq!(parsed, ("pipe.STAGE.chnk0".to_string(), MetadataFile::Heartbeat, 12));
        assert!(JournalEntry::parse("pipe.STAGE.bogus.3").is_none());
        assert!(JournalEntry::parse("heartbeat.3").is_none());
        assert!(JournalEntry::parse("pipe.complete.x").is_none());
    }

    #[test]
    fn test_record_is_strictly_increasing_and_prunes() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(dir.path());

        let seqs: Vec<u64> = (0..5)
            .map(|_| journal.record("p.S", MetadataFile::Heartbeat).unwrap())
            .collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![format!("p.S.heartbeat.{}", seqs[4])]);
    }

    #[test]
    fn test_new_writer_continues_after_existing_markers() {
        let dir = TempDir::new().unwrap();
        let first = Journal::new(dir.path());
        let a = first.record("p.S", MetadataFile::Complete).unwrap();
        let b = first.record("p.S", MetadataFile::Complete).unwrap();

        let second = Journal::new(dir.path());
        let c = second.record("p.S", MetadataFile::Complete).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_scanner_never_misses_a_write() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(dir.path());
        let mut scanner = JournalScanner::new(dir.path());

        assert!(scanner.scan().unwrap().is_empty());

        for round in 0..4 {
            for _ in 0..=round {
                journal.record("p.S", MetadataFile::Heartbeat).unwrap();
            }
            let changed = scanner.scan().unwrap();
            assert_eq!(changed.len(), 1, "round {round}");
            assert_eq!(changed[0].file, MetadataFile::Heartbeat);
            assert!(scanner.scan().unwrap().is_empty());
        }
    }

    #[test]
    fn test_scanner_reports_each_key_once() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(dir.path());
        journal.record("p.A", MetadataFile::Log).unwrap();
        journal.record("p.A", MetadataFile::Complete).unwrap();
        journal.record("p.B", MetadataFile::Errors).unwrap();

        let mut scanner = JournalScanner::new(dir.path());
        let changed = scanner.scan().unwrap();
        let keys: Vec<(String, MetadataFile)> =
            changed.into_iter().map(|e| (e.name, e.file)).collect();
        assert_eq!(
            keys,
            vec![
                ("p.A".to_string(), MetadataFile::Complete),
                ("p.A".to_string(), MetadataFile::Log),
                ("p.B".to_string(), MetadataFile::Errors),
            ]
        );
    }

    #[test]
    fn test_remove_all_and_forget() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(dir.path());
        journal.record("p.A", MetadataFile::Log).unwrap();
        journal.record("p.A.chnk0", MetadataFile::Log).unwrap();
        journal.record("p.AB", MetadataFile::Log).unwrap();

        let mut scanner = JournalScanner::new(dir.path());
        assert_eq!(scanner.scan().unwrap().len(), 3);

        assert_eq!(journal.remove_all("p.A").unwrap(), 2);
        scanner.forget("p.A");
        assert!(scanner.highest_seen("p.A.chnk0", MetadataFile::Log).is_none());
        assert!(scanner.highest_seen("p.AB", MetadataFile::Log).is_some());

        let seq = journal.record("p.A", MetadataFile::Log).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(scanner.scan().unwrap().len(), 1);
    }

    #[test]
    fn test_reset_of_chunk_keeps_sibling_with_longer_index() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(dir.path());
        journal.record("p.S.chnk1", MetadataFile::Complete).unwrap();
        journal.record("p.S.chnk10", MetadataFile::Complete).unwrap();
        journal.record("p.S.chnk10", MetadataFile::Log).unwrap();
        fs::write(dir.path().join("p.S.chnk1.notes"), "").unwrap();

        let mut scanner = JournalScanner::new(dir.path());
        assert_eq!(scanner.scan().unwrap().len(), 3);

        assert_eq!(journal.remove_all("p.S.chnk1").unwrap(), 1);
        scanner.forget("p.S.chnk1");
        assert!(scanner.highest_seen("p.S.chnk1", MetadataFile::Complete).is_none());
        assert_eq!(scanner.highest_seen("p.S.chnk10", MetadataFile::Complete), Some(1));
        assert!(dir.path().join("p.S.chnk10.complete.1").exists());
        assert!(dir.path().join("p.S.chnk1.notes").exists());

        assert_eq!(journal.record("p.S.chnk10", MetadataFile::Complete).unwrap(), 2);
    }

    #[test]
    fn test_within() {
        assert!(within("p.S", "p.S"));
        assert!(within("p.S.chnk0", "p.S"));
        assert!(!within("p.SS", "p.S"));
        assert!(!within("p.S.chnk10", "p.S.chnk1"));
    }

    #[test]
    fn test_missing_dir_scans_empty() {
        let dir = TempDir::new().unwrap();
        let mut scanner = JournalScanner::new(dir.path().join("nope"));
        assert!(scanner.scan().unwrap().is_empty());
    }
}
