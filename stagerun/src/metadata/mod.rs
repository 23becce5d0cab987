//! Filesystem-backed metadata store.
//!
//! The supervisor, the job monitor and the worker communicate only through
//! this protocol:
//! - Typed file names ([`MetadataFile`]) act as message types
//! - Every file another process may observe is written with an atomic rename
//! - Journal markers ([`Journal`]) acknowledge that a file changed, so the
//!   supervisor re-reads only the nodes that moved

mod atomic;
mod files;
mod journal;
mod store;

pub use atomic::{tmp_path, write_atomic, write_atomic_with};
pub use files::{MetadataFile, METADATA_PREFIX};
pub use journal::{Journal, JournalEntry, JournalScanner, JOURNAL_DIR};
pub use store::{timestamp, Metadata, FILES_DIR};
