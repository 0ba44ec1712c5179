//! Metadata store abstraction.
//!
//! The engine only needs an ordered byte-keyed map with atomic batches and
//! prefix scans. [`MetaStore`] captures that contract; [`open_store`] picks
//! the backend configured for the data set.

use crate::redb_store::RedbStore;
use crate::sqlite_store::SqliteStore;
use blobnode_common::MetaBackend;
use std::path::Path;
use std::sync::Arc;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata store is corrupted: {0}")]
    Corrupted(String),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for blobnode_common::Error {
    fn from(e: MetaStoreError) -> Self {
        match e {
            MetaStoreError::Io(io) => Self::Io(io),
            other => Self::Metadata(other.to_string()),
        }
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// When a committed batch reaches stable storage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Durability {
    /// Every commit is flushed before it returns
    Immediate,
    /// Commits may be lost on power failure until the next flush
    #[default]
    Eventual,
}

impl Durability {
    #[must_use]
    pub const fn from_sync_writes(sync_writes: bool) -> Self {
        if sync_writes {
            Self::Immediate
        } else {
            Self::Eventual
        }
    }
}

/// A single mutation inside a [`WriteBatch`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Ordered set of mutations committed all-or-nothing
///
/// Operations apply in insertion order, so a later put or delete on the same
/// key wins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    #[must_use]
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Ordered, byte-keyed metadata store
///
/// Keys compare as unsigned byte strings. Implementations are internally
/// synchronized and safe to share across threads.
pub trait MetaStore: Send + Sync {
    /// Point lookup
    fn get(&self, key: &[u8]) -> MetaStoreResult<Option<Vec<u8>>>;

    /// Commit every operation in `batch` atomically
    fn write(&self, batch: WriteBatch) -> MetaStoreResult<()>;

    /// Entries whose key starts with `prefix`, ascending, at most `limit`
    fn scan_prefix(
        &self,
        prefix: &[u8],
        limit: Option<usize>,
    ) -> MetaStoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Greatest entry whose key starts with `prefix`
    fn last_with_prefix(&self, prefix: &[u8]) -> MetaStoreResult<Option<(Vec<u8>, Vec<u8>)>>;

    /// Stream every entry under `prefix` from one consistent snapshot
    ///
    /// Writers are not blocked while the scan runs. The visitor returns
    /// `false` to stop early.
    fn snapshot_scan(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> MetaStoreResult<()>;

    /// Force everything committed so far onto stable storage
    fn flush(&self) -> MetaStoreResult<()>;

    /// Backend kind, for diagnostics
    fn backend(&self) -> MetaBackend;

    fn put(&self, key: &[u8], value: &[u8]) -> MetaStoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }

    fn delete(&self, key: &[u8]) -> MetaStoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch)
    }

    fn contains(&self, key: &[u8]) -> MetaStoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Open (or create) the configured backend inside `dir`
pub fn open_store(
    backend: MetaBackend,
    dir: &Path,
    durability: Durability,
) -> MetaStoreResult<Arc<dyn MetaStore>> {
    std::fs::create_dir_all(dir)?;
    let store: Arc<dyn MetaStore> = match backend {
        MetaBackend::Redb => Arc::new(RedbStore::open(dir.join("blobnode.redb"), durability)?),
        MetaBackend::Sqlite => Arc::new(SqliteStore::open(dir.join("blobnode.db"), durability)?),
    };
    Ok(store)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_store_dispatches_backend() {
        let dir = tempfile::tempdir().unwrap();
        let redb = open_store(MetaBackend::Redb, dir.path(), Durability::Eventual).unwrap();
        assert_eq!(redb.backend(), MetaBackend::Redb);
        assert!(dir.path().join("blobnode.redb").exists());

        let sqlite = open_store(MetaBackend::Sqlite, dir.path(), Durability::Immediate).unwrap();
        assert_eq!(sqlite.backend(), MetaBackend::Sqlite);
        assert!(dir.path().join("blobnode.db").exists());
    }

    #[test]
    fn test_error_maps_to_metadata_kind() {
        let err: blobnode_common::Error = MetaStoreError::Corrupted("bad page".into()).into();
        assert_eq!(err.kind(), blobnode_common::ErrorKind::Undefined);
        assert!(err.to_string().contains("bad page"));
    }
}
