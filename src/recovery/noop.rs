//! A checkpoint store which does nothing.

use super::*;

/// Writes are dropped and reads are the same as an empty store.
///
/// Use when every slot's Source declares no checkpoint coder, or when
/// replaying from the start after a restart is acceptable.
#[derive(Debug, Default)]
pub struct NoopCheckpointStore;

impl NoopCheckpointStore {
    pub fn new() -> Self {
        NoopCheckpointStore {}
    }
}

impl CheckpointStore for NoopCheckpointStore {
    fn read(&self, _key: &SlotKey) -> Result<Option<CheckpointBytes>, SourceError> {
        Ok(None)
    }

    fn write(&self, _key: &SlotKey, _bytes: CheckpointBytes) -> Result<(), SourceError> {
        Ok(())
    }

    fn discard(&self, _key: &SlotKey) -> Result<(), SourceError> {
        Ok(())
    }
}

#[test]
fn noop_store_forgets() {
    let store = NoopCheckpointStore::new();
    let key = SlotKey::new("0000000000000001");
    store.write(&key, CheckpointBytes(vec![1])).unwrap();
    assert_eq!(store.read(&key).unwrap(), None);
}
