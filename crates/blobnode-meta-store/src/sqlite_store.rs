//! Metadata store backed by SQLite.
//!
//! Records live in a single `WITHOUT ROWID` table keyed by BLOB, which SQLite
//! orders bytewise. The database runs in WAL mode so snapshot scans on a
//! separate read connection never block the writer.

use crate::keys::prefix_successor;
use crate::store::{BatchOp, Durability, MetaStore, MetaStoreError, MetaStoreResult, WriteBatch};
use blobnode_common::MetaBackend;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv_store (
    key BLOB PRIMARY KEY,
    value BLOB NOT NULL
) WITHOUT ROWID";

/// Persistent metadata store backed by SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: impl AsRef<Path>, durability: Durability) -> MetaStoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let synchronous = match durability {
            Durability::Immediate => "FULL",
            Durability::Eventual => "NORMAL",
        };
        conn.pragma_update(None, "synchronous", synchronous)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute(SCHEMA, [])?;

        Self::verify(&conn, &path)?;

        info!("Opened sqlite metadata store at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Database file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a quick integrity check, attempting an index rebuild on failure
    fn verify(conn: &Connection, path: &Path) -> MetaStoreResult<()> {
        if Self::quick_check(conn)? {
            return Ok(());
        }
        warn!("Metadata store at {:?} failed its integrity check, rebuilding", path);
        conn.execute_batch("REINDEX; VACUUM;")?;
        if Self::quick_check(conn)? {
            return Ok(());
        }
        Err(MetaStoreError::Corrupted(format!(
            "{}: integrity check failed after rebuild",
            path.display()
        )))
    }

    fn quick_check(conn: &Connection) -> MetaStoreResult<bool> {
        let result: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        Ok(result == "ok")
    }

    fn query_prefix(
        conn: &Connection,
        prefix: &[u8],
        limit: i64,
        descending: bool,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> MetaStoreResult<()> {
        let order = if descending { "DESC" } else { "ASC" };
        let upper = prefix_successor(prefix);
        let sql = if upper.is_some() {
            format!(
                "SELECT key, value FROM kv_store WHERE key >= ?1 AND key < ?2 \
                 ORDER BY key {order} LIMIT ?3"
            )
        } else {
            format!("SELECT key, value FROM kv_store WHERE key >= ?1 ORDER BY key {order} LIMIT ?2")
        };
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = match upper {
            Some(upper) => stmt.query(params![prefix, upper, limit])?,
            None => stmt.query(params![prefix, limit])?,
        };
        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            if !visit(&key, &value) {
                break;
            }
        }
        Ok(())
    }
}

impl MetaStore for SqliteStore {
    fn get(&self, key: &[u8]) -> MetaStoreResult<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT value FROM kv_store WHERE key = ?1")?;
        Ok(stmt.query_row(params![key], |row| row.get(0)).optional()?)
    }

    fn write(&self, batch: WriteBatch) -> MetaStoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut put =
                tx.prepare_cached("INSERT OR REPLACE INTO kv_store (key, value) VALUES (?1, ?2)")?;
            let mut delete = tx.prepare_cached("DELETE FROM kv_store WHERE key = ?1")?;
            for op in batch.ops() {
                match op {
                    BatchOp::Put { key, value } => {
                        put.execute(params![key, value])?;
                    }
                    BatchOp::Delete { key } => {
                        delete.execute(params![key])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        limit: Option<usize>,
    ) -> MetaStoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let mut out = Vec::new();
        let conn = self.conn.lock();
        Self::query_prefix(&conn, prefix, limit, false, &mut |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            true
        })?;
        Ok(out)
    }

    fn last_with_prefix(&self, prefix: &[u8]) -> MetaStoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        let mut last = None;
        let conn = self.conn.lock();
        Self::query_prefix(&conn, prefix, 1, true, &mut |k, v| {
            last = Some((k.to_vec(), v.to_vec()));
            false
        })?;
        Ok(last)
    }

    fn snapshot_scan(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> MetaStoreResult<()> {
        // A single SELECT on its own connection reads one WAL snapshot
        let reader = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::query_prefix(&reader, prefix, -1, false, visit)
    }

    fn flush(&self) -> MetaStoreResult<()> {
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(FULL)", [], |_| Ok(()))?;
        Ok(())
    }

    fn backend(&self) -> MetaBackend {
        MetaBackend::Sqlite
    }
}
