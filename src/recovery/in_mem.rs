//! Checkpoint store with all data in memory.
//!
//! Marks survive for as long as the worker process does, which is
//! enough to resume a slot whose cached reader was retired.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::*;

#[derive(Debug, Default)]
pub struct InMemCheckpointStore {
    db: Mutex<HashMap<SlotKey, CheckpointBytes>>,
}

impl InMemCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.db.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointStore for InMemCheckpointStore {
    fn read(&self, key: &SlotKey) -> Result<Option<CheckpointBytes>, SourceError> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(db.get(key).cloned())
    }

    fn write(&self, key: &SlotKey, bytes: CheckpointBytes) -> Result<(), SourceError> {
        tracing::trace!("Writing checkpoint for {key:?}");
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.insert(key.clone(), bytes);
        Ok(())
    }

    fn discard(&self, key: &SlotKey) -> Result<(), SourceError> {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.remove(key);
        Ok(())
    }
}

#[test]
fn in_mem_store_upserts_and_discards() {
    let store = InMemCheckpointStore::new();
    let key = SlotKey::new("0000000000000001");
    assert_eq!(store.read(&key).unwrap(), None);
    store.write(&key, CheckpointBytes(vec![1])).unwrap();
    store.write(&key, CheckpointBytes(vec![2])).unwrap();
    assert_eq!(store.read(&key).unwrap(), Some(CheckpointBytes(vec![2])));
    assert_eq!(store.len(), 1);
    store.discard(&key).unwrap();
    assert!(store.is_empty());
}
