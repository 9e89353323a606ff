//! Durable storage for unbounded readers' checkpoint marks.
//!
//! When a bundle of an unbounded slot finishes, the reader's
//! checkpoint mark is encoded with its Source's coder and written
//! here under the slot key. A worker that picks the slot up again
//! without a cached reader resumes from whatever was last written.
//!
//! A store is modeled as a K-V table from [`SlotKey`] to
//! [`CheckpointBytes`]. Writes replace.

use std::fmt::Debug;
use std::sync::Arc;

use crate::config::PipelineOptions;
use crate::errors::SourceError;
use crate::session::SlotKey;

pub mod in_mem;
pub mod noop;
pub mod sqlite;

pub use in_mem::InMemCheckpointStore;
pub use noop::NoopCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

/// An encoded checkpoint mark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointBytes(pub Vec<u8>);

/// Where checkpoint marks are kept between bundles.
///
/// Shared by every slot of a worker; implementations synchronize
/// internally.
pub trait CheckpointStore: Debug + Send + Sync {
    fn read(&self, key: &SlotKey) -> Result<Option<CheckpointBytes>, SourceError>;

    fn write(&self, key: &SlotKey, bytes: CheckpointBytes) -> Result<(), SourceError>;

    fn discard(&self, key: &SlotKey) -> Result<(), SourceError>;
}

/// Open the store named by the options: SQLite if a database path is
/// set, memory otherwise.
pub fn open_store(options: &PipelineOptions) -> Result<Arc<dyn CheckpointStore>, SourceError> {
    match &options.checkpoint_db {
        Some(path) => Ok(Arc::new(SqliteCheckpointStore::open(path)?)),
        None => Ok(Arc::new(InMemCheckpointStore::new())),
    }
}

#[test]
fn open_store_defaults_to_memory() {
    let store = open_store(&PipelineOptions::default()).unwrap();
    let key = SlotKey::for_split(0);
    store.write(&key, CheckpointBytes(vec![4])).unwrap();
    assert_eq!(store.read(&key).unwrap(), Some(CheckpointBytes(vec![4])));
    assert!(format!("{store:?}").contains("InMemCheckpointStore"));
}
