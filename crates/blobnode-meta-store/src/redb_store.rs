//! Metadata store backed by redb.
//!
//! All records share one table. Each batch is one write transaction; reads
//! and snapshot scans run in read transactions, which see a stable view
//! while later writes commit.

use crate::keys::prefix_successor;
use crate::store::{BatchOp, Durability, MetaStore, MetaStoreError, MetaStoreResult, WriteBatch};
use crate::tables;
use blobnode_common::MetaBackend;
use redb::{Builder, Database, ReadableTable, RepairSession};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

impl From<Durability> for redb::Durability {
    fn from(d: Durability) -> Self {
        match d {
            Durability::Immediate => Self::Immediate,
            Durability::Eventual => Self::Eventual,
        }
    }
}

/// Persistent metadata store backed by redb.
pub struct RedbStore {
    db: Database,
    durability: Durability,
    path: PathBuf,
}

impl RedbStore {
    /// Open (or create) the redb database at the given path.
    ///
    /// A file left inconsistent by a crash is repaired in place; a file
    /// that cannot be repaired fails the open.
    pub fn open(path: impl AsRef<Path>, durability: Durability) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut db = Builder::new()
            .set_repair_callback(|session: &mut RepairSession| {
                info!("Repairing metadata store: {:.0}%", session.progress() * 100.0);
            })
            .create(path)?;

        match db.check_integrity() {
            Ok(true) => {}
            Ok(false) => warn!("Metadata store at {:?} was repaired", path),
            Err(e) => {
                return Err(MetaStoreError::Corrupted(format!(
                    "{}: {e}",
                    path.display()
                )));
            }
        }

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::KV)?;
        }
        write_txn.commit()?;

        info!("Opened redb metadata store at {:?}", path);
        Ok(Self {
            db,
            durability,
            path: path.to_path_buf(),
        })
    }

    /// Database file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn scan(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> MetaStoreResult<()> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::KV)?;
        let upper = prefix_successor(prefix);
        let range = match upper.as_deref() {
            Some(upper) => table.range::<&[u8]>(prefix..upper)?,
            None => table.range::<&[u8]>(prefix..)?,
        };
        for entry in range {
            let (k, v) = entry?;
            if !visit(k.value(), v.value()) {
                break;
            }
        }
        Ok(())
    }
}

impl MetaStore for RedbStore {
    fn get(&self, key: &[u8]) -> MetaStoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::KV)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn write(&self, batch: WriteBatch) -> MetaStoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut write_txn = self.db.begin_write()?;
        write_txn.set_durability(self.durability.into());
        {
            let mut table = write_txn.open_table(tables::KV)?;
            for op in batch.into_ops() {
                match op {
                    BatchOp::Put { key, value } => {
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                    BatchOp::Delete { key } => {
                        table.remove(key.as_slice())?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        limit: Option<usize>,
    ) -> MetaStoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        self.scan(prefix, &mut |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            out.len() < limit
        })?;
        Ok(out)
    }

    fn last_with_prefix(&self, prefix: &[u8]) -> MetaStoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::KV)?;
        let upper = prefix_successor(prefix);
        let mut range = match upper.as_deref() {
            Some(upper) => table.range::<&[u8]>(prefix..upper)?,
            None => table.range::<&[u8]>(prefix..)?,
        };
        match range.next_back() {
            Some(entry) => {
                let (k, v) = entry?;
                Ok(Some((k.value().to_vec(), v.value().to_vec())))
            }
            None => Ok(None),
        }
    }

    fn snapshot_scan(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> MetaStoreResult<()> {
        self.scan(prefix, visit)
    }

    fn flush(&self) -> MetaStoreResult<()> {
        // An empty immediate commit persists every earlier eventual commit
        let mut write_txn = self.db.begin_write()?;
        write_txn.set_durability(redb::Durability::Immediate);
        write_txn.commit()?;
        Ok(())
    }

    fn backend(&self) -> MetaBackend {
        MetaBackend::Redb
    }
}
