//! Durable record store backed by redb.
//!
//! Keys are domain names as they appear on the stream, values are the raw
//! record payloads. A later write for a key replaces the earlier value.

use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTableMetadata, TableDefinition, TableError};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::DnsError;

/// Namespace holding every ingested record payload.
const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");

/// Write side of the store, as used by the ingestion pipeline.
pub trait RecordWriter: Send + Sync + 'static {
    /// Persist `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DnsError>;
}

/// Thread-safe handle to the record database.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DnsError> {
        let path = path.as_ref();
        let db = Database::create(path)?;
        info!(path = %path.display(), "opened record store");
        Ok(Self { db: Arc::new(db) })
    }

    /// Create a store that lives only in memory.
    pub fn in_memory() -> Result<Self, DnsError> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Read the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DnsError> {
        let tx = self.db.begin_read()?;
        let table = match tx.open_table(RECORDS) {
            Ok(table) => table,
            // Nothing has been written yet.
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = table.get(key)?.map(|guard| guard.value().to_vec());
        Ok(value)
    }

    /// Number of stored keys.
    pub fn len(&self) -> Result<u64, DnsError> {
        let tx = self.db.begin_read()?;
        match tx.open_table(RECORDS) {
            Ok(table) => Ok(table.len()?),
            Err(TableError::TableDoesNotExist(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// True when no key has been stored.
    pub fn is_empty(&self) -> Result<bool, DnsError> {
        Ok(self.len()? == 0)
    }
}

impl RecordWriter for Store {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DnsError> {
        let tx = self.db.begin_write()?;
        {
            // Creates the namespace on first use.
            let mut table = tx.open_table(RECORDS)?;
            table.insert(key, value)?;
        }
        tx.commit()?;
        debug!(key = %String::from_utf8_lossy(key), bytes = value.len(), "stored record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_before_any_write_is_absent() {
        let store = Store::in_memory().unwrap();
        assert_eq!(store.get(b"example.com.").unwrap(), None);
        assert_eq!(store.len().unwrap(), 0);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_put_then_get() {
        let store = Store::in_memory().unwrap();
        store.put(b"example.com.", b"v1").unwrap();
        assert_eq!(store.get(b"example.com.").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.get(b"other.com.").unwrap(), None);
    }

    #[test]
    fn test_last_write_wins() {
        let store = Store::in_memory().unwrap();
        store.put(b"example.com.", b"v1").unwrap();
        store.put(b"example.com.", b"v2").unwrap();
        assert_eq!(store.get(b"example.com.").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_identical_write_is_idempotent() {
        let store = Store::in_memory().unwrap();
        store.put(b"example.com.", b"v1").unwrap();
        store.put(b"example.com.", b"v1").unwrap();
        assert_eq!(store.get(b"example.com.").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.redb");

        {
            let store = Store::open(&path).unwrap();
            store.put(b"*.example.com.", b"wild").unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.get(b"*.example.com.").unwrap(), Some(b"wild".to_vec()));
    }
}
