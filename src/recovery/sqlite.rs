//! SQLite implementation of the checkpoint store.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use rusqlite_migration::{Migrations, M};

use super::*;

fn get_migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE checkpoints ( \
         created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
         slot_key TEXT NOT NULL PRIMARY KEY, \
         ser_mark BLOB NOT NULL \
         ) STRICT",
    )])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<(), SourceError> {
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    get_migrations().to_latest(conn)?;
    Ok(())
}

/// Checkpoint marks in one SQLite database file, one row per slot.
#[derive(Debug)]
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open (creating if needed) the database at `db_file`.
    pub fn open(db_file: &Path) -> Result<Self, SourceError> {
        tracing::debug!("Opening Sqlite connection to {db_file:?}");
        let mut conn = Connection::open_with_flags(
            db_file,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        setup_conn(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// A private database that vanishes with the store.
    pub fn open_in_memory() -> Result<Self, SourceError> {
        let mut conn = Connection::open_in_memory()?;
        get_migrations().to_latest(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn read(&self, key: &SlotKey) -> Result<Option<CheckpointBytes>, SourceError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let ser_mark: Option<Vec<u8>> = conn
            .query_row(
                "SELECT ser_mark FROM checkpoints WHERE slot_key = ?1",
                [key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ser_mark.map(CheckpointBytes))
    }

    fn write(&self, key: &SlotKey, bytes: CheckpointBytes) -> Result<(), SourceError> {
        tracing::trace!("Writing checkpoint for {key:?}");
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO checkpoints (slot_key, ser_mark) \
             VALUES (?1, ?2) \
             ON CONFLICT (slot_key) DO UPDATE \
             SET ser_mark = EXCLUDED.ser_mark, created_at = CURRENT_TIMESTAMP",
            (key.as_str(), bytes.0),
        )?;
        Ok(())
    }

    fn discard(&self, key: &SlotKey) -> Result<(), SourceError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "DELETE FROM checkpoints WHERE slot_key = ?1",
            [key.as_str()],
        )?;
        Ok(())
    }
}

#[test]
fn sqlite_store_upserts_and_discards() {
    let store = SqliteCheckpointStore::open_in_memory().unwrap();
    let key = SlotKey::new("0000000000000002");
    assert_eq!(store.read(&key).unwrap(), None);
    store.write(&key, CheckpointBytes(vec![1, 2])).unwrap();
    store.write(&key, CheckpointBytes(vec![3])).unwrap();
    assert_eq!(store.read(&key).unwrap(), Some(CheckpointBytes(vec![3])));
    store.discard(&key).unwrap();
    assert_eq!(store.read(&key).unwrap(), None);
}

#[test]
fn sqlite_store_survives_reopen() {
    let path = std::env::temp_dir().join(format!(
        "flowsource-checkpoints-{}.sqlite3",
        fastrand::u64(..)
    ));
    let key = SlotKey::new("0000000000000003");
    {
        let store = SqliteCheckpointStore::open(&path).unwrap();
        store.write(&key, CheckpointBytes(vec![9])).unwrap();
    }
    let store = SqliteCheckpointStore::open(&path).unwrap();
    assert_eq!(store.read(&key).unwrap(), Some(CheckpointBytes(vec![9])));
    drop(store);
    for suffix in ["", "-wal", "-shm"] {
        let mut file = path.clone().into_os_string();
        file.push(suffix);
        let _ = std::fs::remove_file(file);
    }
}
