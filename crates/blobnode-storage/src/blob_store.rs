//! Capability interface consumed by front-ends.
//!
//! RPC or HTTP layers hold an `Arc<dyn BlobStore>` instead of reaching into
//! the engine.

use crate::engine::{BlobEngine, EngineStats, FragReport, PathEntry};
use crate::snapshot::{FileSnapshot, ImportOutcome, SnapshotEntry, SnapshotGroup};
use blobnode_common::{NodeId, Result};

pub trait BlobStore: Send + Sync {
    /// Store `data` under `path`; returns the sequence number in listing mode
    fn append(&self, path: &str, data: &[u8], compress: Option<i32>) -> Result<Option<u64>>;
    fn get(&self, path: &str) -> Result<Vec<u8>>;
    fn delete(&self, path: &str) -> Result<()>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
    fn exists(&self, path: &str) -> Result<bool>;
    fn list_by_prefix(&self, prefix: &str) -> Result<Vec<PathEntry>>;
    fn list_by_range(&self, start: u64, limit: usize) -> Result<Vec<PathEntry>>;
    fn defragment(&self, node: NodeId) -> Result<()>;
    fn fragmentation(&self, node: NodeId) -> Result<FragReport>;
    fn export_all(&self, visit: &mut dyn FnMut(SnapshotEntry) -> bool) -> Result<u64>;
    fn export_by_range(
        &self,
        start: u64,
        limit: usize,
        visit: &mut dyn FnMut(SnapshotGroup) -> bool,
    ) -> Result<u64>;
    fn export_by_paths(
        &self,
        paths: &[String],
        visit: &mut dyn FnMut(SnapshotGroup) -> bool,
    ) -> Result<u64>;
    fn export_file_data(
        &self,
        start: u64,
        limit: usize,
        visit: &mut dyn FnMut(FileSnapshot) -> bool,
    ) -> Result<u64>;
    fn import_entry(&self, entry: &SnapshotEntry, overwrite: bool) -> Result<ImportOutcome>;
    fn import_file(&self, file: &FileSnapshot) -> Result<ImportOutcome>;
    fn stats(&self) -> EngineStats;
}

impl BlobStore for BlobEngine {
    fn append(&self, path: &str, data: &[u8], compress: Option<i32>) -> Result<Option<u64>> {
        Self::append(self, path, data, compress)
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        Self::get(self, path)
    }

    fn delete(&self, path: &str) -> Result<()> {
        Self::delete(self, path)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        Self::rename(self, from, to)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Self::exists(self, path)
    }

    fn list_by_prefix(&self, prefix: &str) -> Result<Vec<PathEntry>> {
        Self::list_by_prefix(self, prefix)
    }

    fn list_by_range(&self, start: u64, limit: usize) -> Result<Vec<PathEntry>> {
        Self::list_by_range(self, start, limit)
    }

    fn defragment(&self, node: NodeId) -> Result<()> {
        Self::defragment(self, node)
    }

    fn fragmentation(&self, node: NodeId) -> Result<FragReport> {
        Self::fragmentation(self, node)
    }

    fn export_all(&self, visit: &mut dyn FnMut(SnapshotEntry) -> bool) -> Result<u64> {
        Self::export_all(self, visit)
    }

    fn export_by_range(
        &self,
        start: u64,
        limit: usize,
        visit: &mut dyn FnMut(SnapshotGroup) -> bool,
    ) -> Result<u64> {
        Self::export_by_range(self, start, limit, visit)
    }

    fn export_by_paths(
        &self,
        paths: &[String],
        visit: &mut dyn FnMut(SnapshotGroup) -> bool,
    ) -> Result<u64> {
        Self::export_by_paths(self, paths, visit)
    }

    fn export_file_data(
        &self,
        start: u64,
        limit: usize,
        visit: &mut dyn FnMut(FileSnapshot) -> bool,
    ) -> Result<u64> {
        Self::export_file_data(self, start, limit, visit)
    }

    fn import_entry(&self, entry: &SnapshotEntry, overwrite: bool) -> Result<ImportOutcome> {
        Self::import_entry(self, entry, overwrite)
    }

    fn import_file(&self, file: &FileSnapshot) -> Result<ImportOutcome> {
        Self::import_file(self, file)
    }

    fn stats(&self) -> EngineStats {
        Self::stats(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::test_config;
    use std::sync::Arc;

    #[test]
    fn test_front_end_through_trait_object() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(test_config(dir.path())).unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(engine);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let path = format!("/front/{i}");
                    store.append(&path, b"shared body", None).unwrap();
                    assert_eq!(store.get(&path).unwrap(), b"shared body");
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(store.exists("/front/0").unwrap());
        store.rename("/front/0", "/front/renamed").unwrap();
        store.delete("/front/1").unwrap();
        assert_eq!(store.list_by_prefix("/front/").unwrap().len(), 3);
        assert_eq!(store.list_by_range(0, 2).unwrap().len(), 2);
        let stats = store.stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.sequence, 4);
    }
}
