//! Node compaction
//!
//! Live records of a sealed node are copied into a temporary file, then the
//! blob records are repointed and the file swapped in. The copy runs next to
//! normal traffic; only the final swap holds the gate for write.
//!
//! The swap is made crash safe by a `SwapBean` marker committed in the same
//! batch as the repointed blob records. Startup finishes any swap whose
//! marker is still present, and discards (then redoes) any temporary output
//! that has no marker.

use crate::engine::BlobEngine;
use crate::engine::FragReport;
use crate::node::{NodeFile, ScanStep};
use blobnode_common::{DefragMode, Error, Fingerprint, NodeId, Result, TailPolicy};
use blobnode_meta_store::keys::{self, PENDING_SWAP};
use blobnode_meta_store::{Bean, MetaKey, NodeBean, SwapBean, WriteBatch};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A live record copied into the compaction output
struct Moved {
    blob_fp: Fingerprint,
    old_offset: u64,
    new_offset: u64,
    record_len: u64,
}

impl BlobEngine {
    /// Space accounting of a sealed node
    pub fn fragmentation(&self, node: NodeId) -> Result<FragReport> {
        let _gate = self.enter()?;
        if self.nodes.active_id() == Some(node) {
            return Err(Error::DefragForbidden(node));
        }
        let mapped = self
            .nodes
            .get(node)
            .ok_or_else(|| Error::not_found(format!("node {node}")))?;
        let file_size = std::fs::metadata(mapped.path())?.len();
        let committed_size = self.load_node_end(node)?.unwrap_or_else(|| mapped.end());
        let reclaimable_size = self.load_node_bean(node)?.reclaimable_size;
        Ok(FragReport {
            node,
            file_size,
            committed_size,
            reclaimable_size,
            live_size: committed_size.saturating_sub(reclaimable_size),
        })
    }

    /// Rewrite a sealed node without its dead records
    ///
    /// A node left with no live record is deleted outright.
    pub fn defragment(&self, node: NodeId) -> Result<()> {
        self.check_running()?;
        if self.nodes.active_id() == Some(node) {
            return Err(Error::DefragForbidden(node));
        }
        let source = self
            .nodes
            .get(node)
            .ok_or_else(|| Error::not_found(format!("node {node}")))?;
        if !self.compacting.lock().insert(node) {
            return Err(Error::undefined(format!(
                "node {node} is already being compacted"
            )));
        }
        let result = self.compact(&source);
        self.compacting.lock().remove(&node);
        result
    }

    fn compact(&self, source: &Arc<NodeFile>) -> Result<()> {
        let node = source.id();
        // rotations and appends that picked this node before it was sealed
        // hold the gate until their blob record is committed
        let limit = {
            let _gate = self.gate.write();
            if self.nodes.active_id() == Some(node) {
                return Err(Error::DefragForbidden(node));
            }
            source.end()
        };
        let target = match self.config.defrag_mode {
            DefragMode::Cover => node,
            DefragMode::Relocate => self.unused_node_id(),
        };
        let temp_path = self.nodes.temp_path(node);
        info!("Compacting node {} ({} committed bytes) into {}", node, limit, target);

        let (output, moved) = if limit == 0 {
            (None, Vec::new())
        } else {
            let output = NodeFile::create(&temp_path, target, limit, false)?;
            match self.copy_live(source, &output, limit) {
                Ok(moved) => (Some(output), moved),
                Err(e) => {
                    drop(output);
                    discard(&temp_path);
                    return Err(e);
                }
            }
        };

        let result = self.swap_in(source, target, limit, output, &moved, &temp_path);
        // once the marker is committed the output belongs to startup recovery
        if result.is_err() && temp_path.exists() && !self.swap_pending(node) {
            discard(&temp_path);
        }
        result
    }

    /// Copy every live record of `source` below `limit` into `output`
    fn copy_live(&self, source: &NodeFile, output: &NodeFile, limit: u64) -> Result<Vec<Moved>> {
        let node = source.id();
        let fp_len = self.fp_len();
        let mut moved = Vec::new();
        let mut cursor = 0;
        let mut empty_run = 0;
        loop {
            match source.scan(cursor, fp_len, limit) {
                ScanStep::Record {
                    fingerprint,
                    offset,
                    len,
                    next,
                } => {
                    empty_run = 0;
                    if self.is_live_at(&fingerprint, node, offset)? {
                        let raw = source.raw_record(offset, fp_len, len)?;
                        let new_offset = output.append_raw(&raw)?;
                        moved.push(Moved {
                            blob_fp: fingerprint,
                            old_offset: offset,
                            new_offset,
                            record_len: raw.len() as u64,
                        });
                    }
                    cursor = next;
                }
                ScanStep::Empty { next } => {
                    empty_run += 1;
                    if empty_run >= self.config.defrag_empty_record_limit {
                        debug!(
                            "Node {}: {} empty records at {}, stopping scan",
                            node, empty_run, cursor
                        );
                        break;
                    }
                    cursor = next;
                }
                ScanStep::Invalid { offset } => match self.config.defrag_tail_policy {
                    TailPolicy::Abort => {
                        return Err(Error::corruption(format!(
                            "node {node}: unparsable record at offset {offset}"
                        )));
                    }
                    TailPolicy::Truncate => {
                        warn!(
                            "Node {}: unparsable record at offset {}, dropping the remaining {} bytes",
                            node,
                            offset,
                            limit - offset
                        );
                        break;
                    }
                },
                ScanStep::End => break,
            }
        }
        output.flush()?;
        Ok(moved)
    }

    fn swap_pending(&self, node: NodeId) -> bool {
        self.store
            .contains(MetaKey::pending_swap(node).as_bytes())
            .unwrap_or(true)
    }

    fn is_live_at(&self, blob_fp: &Fingerprint, node: NodeId, offset: u64) -> Result<bool> {
        Ok(self
            .load_file_bean(blob_fp)?
            .is_some_and(|bean| bean.storenode == node && bean.offset == offset))
    }

    fn unused_node_id(&self) -> NodeId {
        loop {
            let id = NodeId::generate();
            if self.nodes.get(id).is_none() && !self.nodes.node_path(id).exists() {
                return id;
            }
        }
    }

    /// Repoint the copied records and replace the source node
    fn swap_in(
        &self,
        source: &NodeFile,
        target: NodeId,
        limit: u64,
        output: Option<NodeFile>,
        moved: &[Moved],
        temp_path: &Path,
    ) -> Result<()> {
        let node = source.id();
        let _gate = self.gate.write();
        self.check_running()?;
        if source.end() != limit {
            return Err(Error::undefined(format!(
                "node {node} grew during compaction"
            )));
        }
        let _commit = self.commit_lock.lock();

        let mut batch = WriteBatch::new();
        let mut patched = Vec::with_capacity(moved.len());
        let mut orphaned = 0;
        for m in moved {
            match self.load_file_bean(&m.blob_fp)? {
                Some(mut bean) if bean.storenode == node && bean.offset == m.old_offset => {
                    bean.storenode = target;
                    bean.offset = m.new_offset;
                    batch.put(MetaKey::blob(&m.blob_fp), bean.to_bytes()?);
                    patched.push(m.blob_fp.clone());
                }
                // released while the copy ran
                _ => orphaned += m.record_len,
            }
        }

        if patched.is_empty() {
            batch.delete(MetaKey::node(node));
            batch.delete(MetaKey::node_end(node));
            self.store.write(batch)?;
            drop(output);
            if temp_path.exists() {
                discard(temp_path);
            }
            self.nodes.remove(node);
            std::fs::remove_file(source.path())?;
            info!("Node {} held no live data and was removed", node);
            return Ok(());
        }

        let Some(output) = output else {
            return Err(Error::undefined(format!(
                "node {node}: records moved without an output file"
            )));
        };
        let written = output.end();
        batch.put(MetaKey::node_end(target), keys::encode_u64(written));
        batch.put(
            MetaKey::node(target),
            NodeBean {
                reclaimable_size: orphaned,
            }
            .to_bytes()?,
        );
        if target != node {
            batch.delete(MetaKey::node(node));
            batch.delete(MetaKey::node_end(node));
        }
        let swap = SwapBean {
            source: node,
            target,
            temp_file: temp_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        batch.put(MetaKey::pending_swap(node), swap.to_bytes()?);
        self.store.write(batch)?;
        drop(output);

        self.install_swap(&swap)?;
        self.store.delete(MetaKey::pending_swap(node).as_bytes())?;
        for blob_fp in &patched {
            self.blob_cache.remove(blob_fp);
        }
        info!(
            "Compacted node {} into {}: {} -> {} bytes, {} records kept",
            node,
            target,
            limit,
            written,
            patched.len()
        );
        Ok(())
    }

    /// Put a committed compaction output in place of its source
    ///
    /// Safe to repeat: a rename that already happened is detected by the
    /// temporary file being gone.
    fn install_swap(&self, swap: &SwapBean) -> Result<()> {
        let temp = self.nodes.dir().join(&swap.temp_file);
        let target_path = self.nodes.node_path(swap.target);
        let end = self.load_node_end(swap.target)?.ok_or_else(|| {
            Error::corruption(format!("compacted node {} has no committed end", swap.target))
        })?;

        if temp.exists() {
            let file = OpenOptions::new().write(true).open(&temp)?;
            file.set_len(end)?;
            file.sync_all()?;
            drop(file);
            std::fs::rename(&temp, &target_path)?;
        } else if !target_path.exists() {
            return Err(Error::corruption(format!(
                "compaction output of node {} is missing",
                swap.source
            )));
        }

        let node = NodeFile::open(&target_path, swap.target, end, self.config.sync_writes)?;
        self.nodes.install(Arc::new(node));
        if swap.source != swap.target {
            self.nodes.remove(swap.source);
            let old = self.nodes.node_path(swap.source);
            if old.exists() {
                std::fs::remove_file(&old)?;
            }
        }
        Ok(())
    }

    /// Complete swaps interrupted by a crash (startup only)
    pub(crate) fn finish_pending_swaps(&self) -> Result<()> {
        for (key, value) in self.store.scan_prefix(PENDING_SWAP, None)? {
            let swap = SwapBean::from_bytes(&value)?;
            info!(
                "Finishing interrupted compaction of node {} into {}",
                swap.source, swap.target
            );
            self.install_swap(&swap)?;
            self.store.delete(&key)?;
        }
        Ok(())
    }

    /// Bytes a compaction of `node` would reclaim
    pub fn reclaimable(&self, node: NodeId) -> Result<u64> {
        Ok(self.load_node_bean(node)?.reclaimable_size)
    }
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("Failed to remove compaction output {:?}: {}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Pending;
    use crate::engine::tests::{random_bytes, test_config};
    use crate::node::header_len;
    use blobnode_common::{EngineConfig, ErrorKind};
    use blobnode_meta_store::{Durability, FileBean, open_store};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::io::{Seek, SeekFrom, Write};
    use std::thread;
    use std::time::Duration;

    /// Bytes a record with a `len`-byte payload occupies
    const fn record_len(fp_len: usize, len: u64) -> u64 {
        header_len(fp_len) as u64 + len
    }

    /// Engine with 4 KiB nodes holding four 1000-byte records each
    fn small_nodes(dir: &Path) -> EngineConfig {
        EngineConfig {
            node_capacity: 4096,
            default_compression: 0,
            ..test_config(dir)
        }
    }

    fn fill(engine: &BlobEngine, count: usize, seed: u64) -> Vec<(String, Vec<u8>)> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|i| {
                let path = format!("/d/{i}");
                let data = random_bytes(&mut rng, 1000);
                engine.append(&path, &data, None).unwrap();
                (path, data)
            })
            .collect()
    }

    fn node_of(engine: &BlobEngine, path: &str) -> NodeId {
        engine.file_bean_of(path).unwrap().unwrap().storenode
    }

    #[test]
    fn test_defragment_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(small_nodes(dir.path())).unwrap();
        let stored = fill(&engine, 6, 1);
        let first = node_of(&engine, "/d/0");
        assert_ne!(engine.active_node(), Some(first));

        engine.delete("/d/1").unwrap();
        engine.delete("/d/2").unwrap();
        let report = engine.fragmentation(first).unwrap();
        assert_eq!(report.reclaimable_size, 2 * record_len(8, 1000));
        assert_eq!(report.file_size, 4096);

        engine.defragment(first).unwrap();
        for (path, data) in &stored {
            match engine.get(path) {
                Ok(got) => assert_eq!(&got, data),
                Err(e) => {
                    assert_eq!(e.kind(), ErrorKind::NotFound);
                    assert!(path == "/d/1" || path == "/d/2");
                }
            }
        }
        assert_eq!(node_of(&engine, "/d/0"), first);
        let report = engine.fragmentation(first).unwrap();
        assert_eq!(report.reclaimable_size, 0);
        assert_eq!(report.file_size, 2 * record_len(8, 1000));
        assert_eq!(report.committed_size, report.file_size);

        // survives a restart
        engine.close().unwrap();
        drop(engine);
        let engine = BlobEngine::open(small_nodes(dir.path())).unwrap();
        assert_eq!(engine.get("/d/3").unwrap(), stored[3].1);
    }

    #[test]
    fn test_defragment_removes_empty_node() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(small_nodes(dir.path())).unwrap();
        fill(&engine, 5, 2);
        let first = node_of(&engine, "/d/0");
        for i in 0..4 {
            assert_eq!(node_of(&engine, &format!("/d/{i}")), first);
            engine.delete(&format!("/d/{i}")).unwrap();
        }
        let path = engine.nodes.node_path(first);
        engine.defragment(first).unwrap();
        assert!(!engine.nodes().contains(&first));
        assert!(!path.exists());
        assert!(engine.node_end(first).unwrap().is_none());
        assert_eq!(
            engine.defragment(first).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_defragment_relocate_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            defrag_mode: DefragMode::Relocate,
            ..small_nodes(dir.path())
        };
        let engine = BlobEngine::open(config).unwrap();
        let stored = fill(&engine, 6, 3);
        let first = node_of(&engine, "/d/0");
        engine.delete("/d/3").unwrap();

        engine.defragment(first).unwrap();
        let moved_to = node_of(&engine, "/d/0");
        assert_ne!(moved_to, first);
        assert!(!engine.nodes().contains(&first));
        assert!(!engine.nodes.node_path(first).exists());
        assert!(engine.node_end(first).unwrap().is_none());
        for (path, data) in stored.iter().filter(|(p, _)| p != "/d/3") {
            assert_eq!(&engine.get(path).unwrap(), data);
        }
    }

    #[test]
    fn test_defragment_active_node_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(small_nodes(dir.path())).unwrap();
        fill(&engine, 1, 4);
        let active = engine.active_node().unwrap();
        assert_eq!(
            engine.defragment(active).unwrap_err().kind(),
            ErrorKind::DefragForbidden
        );
        assert_eq!(
            engine.fragmentation(active).unwrap_err().kind(),
            ErrorKind::DefragForbidden
        );
        assert_eq!(
            engine.defragment(NodeId::generate()).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_dedup_reference_survives_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(small_nodes(dir.path())).unwrap();
        let stored = fill(&engine, 5, 5);
        let first = node_of(&engine, "/d/0");
        engine.append("/alias", &stored[0].1, None).unwrap();
        engine.delete("/d/0").unwrap();
        engine.delete("/d/1").unwrap();

        engine.defragment(first).unwrap();
        assert_eq!(engine.get("/alias").unwrap(), stored[0].1);
        assert_eq!(engine.file_bean_of("/alias").unwrap().unwrap().refcount, 1);
        assert_eq!(engine.file_bean_of("/alias").unwrap().unwrap().offset, 0);
    }

    #[test]
    fn test_compaction_keeps_late_append_to_rotated_node() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(small_nodes(dir.path())).unwrap();
        let stored = fill(&engine, 5, 9);
        let sealed = node_of(&engine, "/d/0");
        assert_ne!(engine.active_node(), Some(sealed));
        engine.delete("/d/1").unwrap();

        // an append that picked the node just before it was rotated away:
        // its record is written but its blob record is not committed yet
        let late = b"late small payload";
        let blob_fp = engine.fingerprint(late);
        let source = engine.nodes.get(sealed).unwrap();
        let gate = engine.gate.read();
        let offset = source.append_record(&blob_fp, late).unwrap().unwrap();
        assert_eq!(offset, 4 * record_len(8, 1000));

        thread::scope(|s| {
            let compaction = s.spawn(|| engine.defragment(sealed));
            thread::sleep(Duration::from_millis(100));
            let bean = FileBean {
                storenode: sealed,
                offset,
                size: late.len() as u64,
                compress: 0,
                refcount: 1,
            };
            let mut pending = Pending {
                count_delta: 1,
                node_end: Some((sealed, offset + bean.record_len(8))),
                ..Default::default()
            };
            pending.batch.put(MetaKey::blob(&blob_fp), bean.to_bytes().unwrap());
            pending
                .batch
                .put(MetaKey::path(&engine.fingerprint(b"/late")), blob_fp.as_bytes());
            engine.commit(pending).unwrap();
            drop(gate);
            compaction.join().unwrap().unwrap();
        });

        assert_eq!(engine.get("/late").unwrap(), late);
        for (path, data) in stored.iter().filter(|(p, _)| p != "/d/1") {
            assert_eq!(&engine.get(path).unwrap(), data);
        }
        let report = engine.fragmentation(sealed).unwrap();
        assert_eq!(report.reclaimable_size, 0);
        assert_eq!(
            report.file_size,
            3 * record_len(8, 1000) + record_len(8, late.len() as u64)
        );
    }

    #[test]
    fn test_compaction_aborts_when_node_grew() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(small_nodes(dir.path())).unwrap();
        let stored = fill(&engine, 5, 10);
        let sealed = node_of(&engine, "/d/0");
        engine.delete("/d/2").unwrap();

        let source = engine.nodes.get(sealed).unwrap();
        let limit = source.end();
        let temp_path = engine.nodes.temp_path(sealed);
        let output = NodeFile::create(&temp_path, sealed, limit, false).unwrap();
        let moved = engine.copy_live(&source, &output, limit).unwrap();
        assert_eq!(moved.len(), 3);

        let late = b"late";
        source
            .append_record(&engine.fingerprint(late), late)
            .unwrap()
            .unwrap();
        let err = engine
            .swap_in(&source, sealed, limit, Some(output), &moved, &temp_path)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Undefined);
        discard(&temp_path);

        assert_eq!(engine.fragmentation(sealed).unwrap().file_size, 4096);
        assert_eq!(engine.reclaimable(sealed).unwrap(), record_len(8, 1000));
        for (path, data) in stored.iter().filter(|(p, _)| p != "/d/2") {
            assert_eq!(&engine.get(path).unwrap(), data);
        }
    }

    #[test]
    fn test_compaction_credits_records_released_during_copy() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(small_nodes(dir.path())).unwrap();
        let stored = fill(&engine, 5, 11);
        let sealed = node_of(&engine, "/d/0");

        let source = engine.nodes.get(sealed).unwrap();
        let limit = source.end();
        let temp_path = engine.nodes.temp_path(sealed);
        let output = NodeFile::create(&temp_path, sealed, limit, false).unwrap();
        let moved = engine.copy_live(&source, &output, limit).unwrap();
        assert_eq!(moved.len(), 4);

        engine.delete("/d/1").unwrap();
        engine
            .swap_in(&source, sealed, limit, Some(output), &moved, &temp_path)
            .unwrap();
        assert!(!temp_path.exists());

        let report = engine.fragmentation(sealed).unwrap();
        assert_eq!(report.file_size, 4 * record_len(8, 1000));
        assert_eq!(report.reclaimable_size, record_len(8, 1000));
        assert_eq!(report.live_size, 3 * record_len(8, 1000));
        assert_eq!(
            engine.get("/d/1").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        for (path, data) in stored.iter().filter(|(p, _)| p != "/d/1") {
            assert_eq!(&engine.get(path).unwrap(), data);
        }

        // the orphaned record goes on the next pass
        engine.defragment(sealed).unwrap();
        let report = engine.fragmentation(sealed).unwrap();
        assert_eq!(report.file_size, 3 * record_len(8, 1000));
        assert_eq!(report.reclaimable_size, 0);
    }

    #[test]
    fn test_compaction_alongside_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(small_nodes(dir.path())).unwrap();
        let stored = fill(&engine, 16, 12);
        let (kept, doomed): (Vec<_>, Vec<_>) = stored
            .iter()
            .enumerate()
            .partition(|(i, _)| i % 2 == 0);

        let added = thread::scope(|s| {
            s.spawn(|| {
                for (_, (path, _)) in &doomed {
                    engine.delete(path).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..3 {
                    for node in engine.nodes() {
                        if let Err(e) = engine.defragment(node) {
                            assert!(
                                matches!(
                                    e.kind(),
                                    ErrorKind::DefragForbidden | ErrorKind::NotFound
                                ),
                                "{e}"
                            );
                        }
                    }
                }
            });
            let appender = s.spawn(|| {
                let mut rng = StdRng::seed_from_u64(13);
                (0..8)
                    .map(|i| {
                        let path = format!("/n/{i}");
                        let data = random_bytes(&mut rng, 600);
                        engine.append(&path, &data, None).unwrap();
                        (path, data)
                    })
                    .collect::<Vec<_>>()
            });
            appender.join().unwrap()
        });

        for (_, (path, data)) in &kept {
            assert_eq!(&engine.get(path).unwrap(), data);
        }
        for (_, (path, _)) in &doomed {
            assert_eq!(engine.get(path).unwrap_err().kind(), ErrorKind::NotFound);
        }
        for (path, data) in &added {
            assert_eq!(&engine.get(path).unwrap(), data);
        }
        assert_eq!(engine.count(), 16);

        // once traffic stops, one pass leaves no dead bytes in sealed nodes
        let active = engine.active_node();
        for node in engine.nodes().into_iter().filter(|n| Some(*n) != active) {
            engine.defragment(node).unwrap();
        }
        for node in engine.nodes().into_iter().filter(|n| Some(*n) != active) {
            assert_eq!(engine.reclaimable(node).unwrap(), 0);
        }
    }

    /// Overwrite the length field of the record at `offset`
    fn corrupt_len(path: &Path, offset: u64) {
        let mut file = OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(offset + 8)).unwrap();
        file.write_all(&u32::MAX.to_be_bytes()).unwrap();
        file.sync_all().unwrap();
    }

    #[test]
    fn test_tail_policy() {
        for policy in [TailPolicy::Abort, TailPolicy::Truncate] {
            let dir = tempfile::tempdir().unwrap();
            let config = EngineConfig {
                defrag_tail_policy: policy,
                ..small_nodes(dir.path())
            };
            let (first, stored) = {
                let engine = BlobEngine::open(config.clone()).unwrap();
                let stored = fill(&engine, 5, 6);
                let first = node_of(&engine, "/d/0");
                let second_offset = engine.file_bean_of("/d/1").unwrap().unwrap().offset;
                engine.close().unwrap();
                corrupt_len(&engine.nodes.node_path(first), second_offset);
                (first, stored)
            };

            let engine = BlobEngine::open(config).unwrap();
            let result = engine.defragment(first);
            match policy {
                TailPolicy::Abort => {
                    assert_eq!(result.unwrap_err().kind(), ErrorKind::Undefined);
                    assert_eq!(engine.fragmentation(first).unwrap().file_size, 4096);
                }
                TailPolicy::Truncate => {
                    result.unwrap();
                    assert_eq!(
                        engine.fragmentation(first).unwrap().file_size,
                        record_len(8, 1000)
                    );
                }
            }
            assert_eq!(engine.get("/d/0").unwrap(), stored[0].1);
            let leftovers = engine.nodes.discover().unwrap();
            assert!(leftovers.temps.is_empty());
        }
    }

    #[test]
    fn test_startup_finishes_pending_swap() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_nodes(dir.path());
        let (first, stored) = {
            let engine = BlobEngine::open(config.clone()).unwrap();
            let stored = fill(&engine, 5, 7);
            (node_of(&engine, "/d/0"), stored)
        };

        // a compaction that committed its metadata but crashed before the rename
        let nodes_dir = config.nodes_dir();
        let temp_name = format!("{}_0badcafe", first.encode());
        std::fs::copy(nodes_dir.join(first.encode()), nodes_dir.join(&temp_name)).unwrap();
        {
            let store = open_store(config.meta_backend, &config.meta_dir(), Durability::Immediate)
                .unwrap();
            let swap = SwapBean {
                source: first,
                target: first,
                temp_file: temp_name.clone(),
            };
            store
                .put(
                    MetaKey::pending_swap(first).as_bytes(),
                    &swap.to_bytes().unwrap(),
                )
                .unwrap();
        }

        let engine = BlobEngine::open(config).unwrap();
        assert!(!nodes_dir.join(&temp_name).exists());
        assert!(engine.store.scan_prefix(PENDING_SWAP, None).unwrap().is_empty());
        for (path, data) in &stored {
            assert_eq!(&engine.get(path).unwrap(), data);
        }
    }

    #[test]
    fn test_startup_redoes_unmarked_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_nodes(dir.path());
        let (first, stored) = {
            let engine = BlobEngine::open(config.clone()).unwrap();
            let stored = fill(&engine, 5, 8);
            engine.delete("/d/2").unwrap();
            (node_of(&engine, "/d/0"), stored)
        };
        let nodes_dir = config.nodes_dir();
        let temp = nodes_dir.join(format!("{}_deadbeef", first.encode()));
        std::fs::write(&temp, b"partial output").unwrap();

        let engine = BlobEngine::open(config).unwrap();
        assert!(!temp.exists());
        assert_eq!(engine.reclaimable(first).unwrap(), 0);
        assert_eq!(
            engine.fragmentation(first).unwrap().file_size,
            3 * record_len(8, 1000)
        );
        assert_eq!(engine.get("/d/3").unwrap(), stored[3].1);
    }
}
