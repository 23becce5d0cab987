//! The per-directory metadata store.

use super::atomic::write_atomic;
use super::files::{MetadataFile, METADATA_PREFIX};
use super::journal::Journal;
use crate::core::MetadataState;
use crate::errors::MetadataError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the directory holding a job's working files.
pub const FILES_DIR: &str = "files";

/// Formats the current local time the way metadata timestamps are written.
#[must_use]
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Filesystem-backed execution state of one node, or one phase of a node.
///
/// All reads and writes go through typed [`MetadataFile`] names. Writes other
/// processes may observe are atomic renames; `_log`, `_alarm`, `_stdout` and
/// `_stderr` are append-only streams instead.
#[derive(Debug, Clone)]
pub struct Metadata {
    fqname: String,
    journal_name: String,
    path: PathBuf,
    journal: Arc<Journal>,
    contents: BTreeSet<MetadataFile>,
}

impl Metadata {
    /// Creates a handle; nothing is touched on disk.
    #[must_use]
    pub fn new(
        fqname: impl Into<String>,
        journal_name: impl Into<String>,
        path: impl Into<PathBuf>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            fqname: fqname.into(),
            journal_name: journal_name.into(),
            path: path.into(),
            journal,
            contents: BTreeSet::new(),
        }
    }

    /// Creates a handle for a phase sub-directory such as `chnk0`.
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        Self::new(
            self.fqname.clone(),
            format!("{}.{name}", self.journal_name),
            self.path.join(name),
            Arc::clone(&self.journal),
        )
    }

    /// Fully-qualified name of the owning node.
    #[must_use]
    pub fn fqname(&self) -> &str {
        &self.fqname
    }

    /// Name used for this metadata's journal markers.
    #[must_use]
    pub fn journal_name(&self) -> &str {
        &self.journal_name
    }

    /// The metadata directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The journal this metadata signals through.
    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// Path of a metadata file. Does not touch the filesystem.
    #[must_use]
    pub fn metadata_file_path(&self, file: MetadataFile) -> PathBuf {
        self.path.join(file.file_name())
    }

    /// Path of the job's working files. Does not touch the filesystem.
    #[must_use]
    pub fn files_path(&self) -> PathBuf {
        self.path.join(FILES_DIR)
    }

    /// Creates the metadata and files directories.
    pub fn mkdirs(&self) -> Result<(), MetadataError> {
        let files = self.files_path();
        fs::create_dir_all(&files).map_err(|e| MetadataError::from_io(files, e))
    }

    /// Returns true if the file exists right now.
    #[must_use]
    pub fn exists(&self, file: MetadataFile) -> bool {
        self.metadata_file_path(file).exists()
    }

    /// Returns true if the file was present at the last [`Metadata::refresh`].
    #[must_use]
    pub fn has(&self, file: MetadataFile) -> bool {
        self.contents.contains(&file)
    }

    /// Serializes `value` as JSON and writes it atomically.
    pub fn write<T: Serialize + ?Sized>(
        &self,
        file: MetadataFile,
        value: &T,
    ) -> Result<(), MetadataError> {
        let path = self.metadata_file_path(file);
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| MetadataError::Encode {
            path: path.clone(),
            source,
        })?;
        self.write_bytes(file, &bytes)
    }

    /// Writes free text atomically.
    pub fn write_raw(&self, file: MetadataFile, text: &str) -> Result<(), MetadataError> {
        self.write_bytes(file, text.as_bytes())
    }

    /// Writes the current timestamp atomically.
    pub fn write_time(&self, file: MetadataFile) -> Result<(), MetadataError> {
        self.write_raw(file, &timestamp())
    }

    fn write_bytes(&self, file: MetadataFile, bytes: &[u8]) -> Result<(), MetadataError> {
        let path = self.metadata_file_path(file);
        write_atomic(&path, bytes).map_err(|e| {
            let err = MetadataError::from_io(path, e);
            self.record_write_failure(file, &err);
            err
        })
    }

    /// Appends text to a stream file such as `_log`.
    pub fn append(&self, file: MetadataFile, text: &str) -> Result<(), MetadataError> {
        let path = self.metadata_file_path(file);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(text.as_bytes()))
            .map_err(|e| MetadataError::from_io(path, e))
    }

    fn record_write_failure(&self, file: MetadataFile, err: &MetadataError) {
        warn!(fqname = %self.fqname, file = %file, error = %err, "metadata write failed");
        if file == MetadataFile::Errors {
            return;
        }
        let text = format!("Failed to write {}: {err}", file.file_name());
        if let Err(e) = write_atomic(&self.metadata_file_path(MetadataFile::Errors), text.as_bytes())
        {
            debug!(fqname = %self.fqname, error = %e, "could not record write failure");
        }
    }

    /// Reads and decodes a JSON metadata file.
    pub fn read_into<T: DeserializeOwned>(&self, file: MetadataFile) -> Result<T, MetadataError> {
        let path = self.metadata_file_path(file);
        let bytes = fs::read(&path).map_err(|e| MetadataError::from_io(path.clone(), e))?;
        serde_json::from_slice(&bytes).map_err(|source| MetadataError::Decode { path, source })
    }

    /// Reads a metadata file as text.
    pub fn read_raw(&self, file: MetadataFile) -> Result<String, MetadataError> {
        let path = self.metadata_file_path(file);
        fs::read_to_string(&path).map_err(|e| MetadataError::from_io(path, e))
    }

    /// Removes a metadata file; a missing file is not an error.
    pub fn remove(&self, file: MetadataFile) -> Result<(), MetadataError> {
        let path = self.metadata_file_path(file);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MetadataError::from_io(path, e)),
        }
    }

    /// Signals a change to `file` through the journal.
    ///
    /// Failure only delays the supervisor noticing the change, so it is
    /// logged and swallowed.
    pub fn update_journal(&self, file: MetadataFile) {
        if let Err(e) = self.journal.record(&self.journal_name, file) {
            warn!(
                fqname = %self.fqname,
                file = %file,
                error = %e,
                "could not update journal"
            );
        }
    }

    /// Re-reads which metadata files exist.
    pub fn refresh(&mut self) -> Result<(), MetadataError> {
        self.contents.clear();
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(MetadataError::from_io(self.path.clone(), e)),
        };
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(METADATA_PREFIX) {
                continue;
            }
            if let Some(file) = MetadataFile::from_file_name(name) {
                self.contents.insert(file);
            }
        }
        Ok(())
    }

    /// Marks `file` present without a directory scan, after this process wrote it.
    pub fn note_written(&mut self, file: MetadataFile) {
        self.contents.insert(file);
    }

    /// State derived from the files present at the last refresh.
    #[must_use]
    pub fn state(&self) -> MetadataState {
        if self.has(MetadataFile::Errors) || self.has(MetadataFile::Assert) {
            MetadataState::Failed
        } else if self.has(MetadataFile::Complete) {
            MetadataState::Complete
        } else if self.has(MetadataFile::Disabled) {
            MetadataState::Disabled
        } else if self.has(MetadataFile::Log) {
            MetadataState::Running
        } else if self.has(MetadataFile::JobInfo) {
            MetadataState::Queued
        } else {
            MetadataState::Waiting
        }
    }

    /// Removes the directory and its journal markers, then recreates it empty.
    pub fn reset(&mut self) -> Result<(), MetadataError> {
        self.remove_all()?;
        self.mkdirs()
    }

    /// Removes the directory and its journal markers.
    pub fn remove_all(&mut self) -> Result<(), MetadataError> {
        if let Err(e) = self.journal.remove_all(&self.journal_name) {
            warn!(fqname = %self.fqname, error = %e, "could not remove journal markers");
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(MetadataError::from_io(self.path.clone(), e)),
        }
        self.contents.clear();
        Ok(())
    }
}
