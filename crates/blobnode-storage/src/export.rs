//! Export and import
//!
//! Two ways to move data between engines:
//! - metadata: raw key/value entries, replayed with [`BlobEngine::import_entry`]
//!   next to copies of the node files they reference
//! - file data: decompressed path contents, replayed with
//!   [`BlobEngine::import_file`] into any engine

use crate::engine::{BlobEngine, ListingUpdate, Pending};
use crate::snapshot::{FileSnapshot, ImportOutcome, SnapshotEntry, SnapshotGroup};
use blobnode_common::{Error, Fingerprint, NodeId, Result};
use blobnode_meta_store::keys;
use blobnode_meta_store::{Bean, FileBean, KeyKind, MetaKey, NodeBean, PathBean, WriteBatch};
use std::collections::HashSet;
use tracing::{debug, warn};

impl SnapshotEntry {
    fn from_key(key: MetaKey, value: Vec<u8>) -> Self {
        Self {
            key: key.into_bytes(),
            value,
        }
    }
}

impl BlobEngine {
    /// Stream every metadata entry from one consistent snapshot
    ///
    /// The snapshot does not hold the gate, so a slow `visit` never blocks
    /// compaction or shutdown.
    pub fn export_all(&self, visit: &mut dyn FnMut(SnapshotEntry) -> bool) -> Result<u64> {
        self.check_running()?;
        let mut exported = 0;
        self.store.snapshot_scan(&[], &mut |key: &[u8], value: &[u8]| {
            exported += 1;
            visit(SnapshotEntry {
                key: key.to_vec(),
                value: value.to_vec(),
            })
        })?;
        debug!("Exported {} metadata entries", exported);
        Ok(exported)
    }

    fn check_range(&self, start: u64, limit: usize) -> Result<()> {
        if !self.config.listing {
            return Err(Error::invalid_parameters("listing mode is disabled"));
        }
        if start == 0 || limit == 0 {
            return Err(Error::invalid_parameters(format!(
                "invalid range start {start} limit {limit}"
            )));
        }
        if start > self.sequence() {
            return Err(Error::invalid_parameters(format!(
                "start {start} is past the newest sequence {}",
                self.sequence()
            )));
        }
        Ok(())
    }

    /// Sequence numbers `start..start + limit` that have been allocated
    fn range_seqs(&self, start: u64, limit: usize) -> std::ops::RangeInclusive<u64> {
        let last = start
            .saturating_add(limit as u64 - 1)
            .min(self.sequence());
        start..=last
    }

    /// Metadata groups of up to `limit` paths, oldest first, from `start`
    pub fn export_by_range(
        &self,
        start: u64,
        limit: usize,
        visit: &mut dyn FnMut(SnapshotGroup) -> bool,
    ) -> Result<u64> {
        self.check_range(start, limit)?;
        let _gate = self.enter()?;
        let mut seen_nodes = HashSet::new();
        let mut exported = 0;
        for seq in self.range_seqs(start, limit) {
            let key = MetaKey::path_seq(seq);
            let Some(raw) = self.store.get(key.as_bytes())? else {
                continue;
            };
            let bean = PathBean::from_bytes(&raw)?;
            let listing = SnapshotEntry::from_key(key, raw);
            let Some(group) = self.path_group(seq, &bean.path, Some(listing), &mut seen_nodes)?
            else {
                continue;
            };
            exported += 1;
            if !visit(group) {
                break;
            }
        }
        Ok(exported)
    }

    /// Metadata groups of the named paths; unknown paths are skipped
    pub fn export_by_paths(
        &self,
        paths: &[String],
        visit: &mut dyn FnMut(SnapshotGroup) -> bool,
    ) -> Result<u64> {
        if paths.is_empty() {
            return Err(Error::invalid_parameters("no paths to export"));
        }
        if paths.len() > self.config.max_batch_paths {
            return Err(Error::OversizeBatch {
                count: paths.len(),
                max: self.config.max_batch_paths,
            });
        }
        let _gate = self.enter()?;
        let mut seen_nodes = HashSet::new();
        let mut exported = 0;
        for path in paths {
            let (id, listing) = match self.load_path_seq(path)? {
                Some(seq) => {
                    let key = MetaKey::path_seq(seq);
                    let listing = self
                        .store
                        .get(key.as_bytes())?
                        .map(|raw| SnapshotEntry::from_key(key, raw));
                    (seq, listing)
                }
                None => (0, None),
            };
            let Some(group) = self.path_group(id, path, listing, &mut seen_nodes)? else {
                debug!("Export skipped unknown path {}", path);
                continue;
            };
            exported += 1;
            if !visit(group) {
                break;
            }
        }
        Ok(exported)
    }

    /// Entries describing one path; node entries go out once per export
    fn path_group(
        &self,
        id: u64,
        path: &str,
        listing: Option<SnapshotEntry>,
        seen_nodes: &mut HashSet<NodeId>,
    ) -> Result<Option<SnapshotGroup>> {
        let path_key = MetaKey::path(&self.algo.digest(path.as_bytes()));
        let Some(blob_raw) = self.store.get(path_key.as_bytes())? else {
            return Ok(None);
        };
        let blob_key = MetaKey::blob(&Fingerprint::from_bytes(&blob_raw));

        let mut group = SnapshotGroup {
            id,
            entries: Vec::with_capacity(5),
        };
        group.entries.extend(listing);
        group.entries.push(SnapshotEntry::from_key(path_key, blob_raw));
        let Some(bean_raw) = self.store.get(blob_key.as_bytes())? else {
            warn!("Exported path {} has no blob record", path);
            return Ok(Some(group));
        };
        let bean = FileBean::from_bytes(&bean_raw)?;
        group.entries.push(SnapshotEntry::from_key(blob_key, bean_raw));
        if seen_nodes.insert(bean.storenode) {
            for key in [MetaKey::node(bean.storenode), MetaKey::node_end(bean.storenode)] {
                if let Some(value) = self.store.get(key.as_bytes())? {
                    group.entries.push(SnapshotEntry::from_key(key, value));
                }
            }
        }
        Ok(Some(group))
    }

    /// Decompressed contents of up to `limit` paths, oldest first, from `start`
    pub fn export_file_data(
        &self,
        start: u64,
        limit: usize,
        visit: &mut dyn FnMut(FileSnapshot) -> bool,
    ) -> Result<u64> {
        self.check_range(start, limit)?;
        self.check_running()?;
        let mut exported = 0;
        for seq in self.range_seqs(start, limit) {
            let Some(bean) = self.load_path_bean(seq)? else {
                continue;
            };
            let compress = match self.file_bean_of(&bean.path)? {
                Some(file) => file.compress,
                None => continue,
            };
            let data = match self.read_path(&bean.path) {
                Ok(data) => data,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            exported += 1;
            let snapshot = FileSnapshot {
                id: seq,
                path: bean.path,
                data,
                compress,
            };
            if !visit(snapshot) {
                break;
            }
        }
        Ok(exported)
    }

    /// Replay one exported metadata entry
    ///
    /// Existing entries are kept unless `overwrite` is set. Listing entries
    /// are re-sequenced; derived and reserved entries are skipped.
    pub fn import_entry(&self, entry: &SnapshotEntry, overwrite: bool) -> Result<ImportOutcome> {
        let _gate = self.enter()?;
        match MetaKey::classify(&entry.key) {
            KeyKind::PathSeq => self.import_listing(entry, overwrite),
            KeyKind::Path => self.import_path(entry, overwrite),
            KeyKind::Blob => self.import_blob(entry, overwrite),
            KeyKind::Node | KeyKind::NodeEnd => self.import_node(entry, overwrite),
            KeyKind::PathName | KeyKind::Reserved | KeyKind::Unknown => Ok(ImportOutcome::Skipped),
        }
    }

    fn import_listing(&self, entry: &SnapshotEntry, overwrite: bool) -> Result<ImportOutcome> {
        if !self.config.listing {
            return Ok(ImportOutcome::Skipped);
        }
        let bean = PathBean::from_bytes(&entry.value)?;
        let path_fp = self.algo.digest(bean.path.as_bytes());
        let _guard = self.path_locks.lock(&path_fp);
        let previous = self.load_path_seq(&bean.path)?;
        if previous.is_some() && !overwrite {
            return Ok(ImportOutcome::Skipped);
        }
        self.commit(Pending {
            listing: Some(ListingUpdate {
                path: bean.path,
                timestamp: bean.timestamp,
                previous,
            }),
            ..Default::default()
        })?;
        Ok(ImportOutcome::Applied)
    }

    fn import_path(&self, entry: &SnapshotEntry, overwrite: bool) -> Result<ImportOutcome> {
        let path_fp = Fingerprint::from_bytes(&entry.key[1..]);
        self.check_fingerprint(&path_fp)?;
        let _guard = self.path_locks.lock(&path_fp);
        let existing = self.load_path(&path_fp)?;
        if existing.is_some() && !overwrite {
            return Ok(ImportOutcome::Skipped);
        }
        let repointed = existing
            .as_ref()
            .filter(|old| old.as_bytes() != entry.value.as_slice());
        if let Some(old) = repointed {
            // reference counts travel with the blob entries of the same export
            warn!(
                "Import repoints path {} from blob {} to {}; reference counts are not adjusted",
                path_fp,
                old,
                Fingerprint::from_bytes(&entry.value)
            );
        }
        let mut pending = Pending::default();
        pending.batch.put(entry.key.as_slice(), entry.value.as_slice());
        if existing.is_none() {
            pending.count_delta = 1;
        }
        self.commit(pending)?;
        self.path_cache.remove(&path_fp);
        Ok(ImportOutcome::Applied)
    }

    fn import_blob(&self, entry: &SnapshotEntry, overwrite: bool) -> Result<ImportOutcome> {
        let blob_fp = Fingerprint::from_bytes(&entry.key[1..]);
        self.check_fingerprint(&blob_fp)?;
        FileBean::from_bytes(&entry.value)?;
        let _guard = self.blob_locks.lock(&blob_fp);
        if self.load_file_bean(&blob_fp)?.is_some() && !overwrite {
            return Ok(ImportOutcome::Skipped);
        }
        self.store.put(&entry.key, &entry.value)?;
        self.refcounts.invalidate(&blob_fp);
        self.blob_cache.remove(&blob_fp);
        Ok(ImportOutcome::Applied)
    }

    fn import_node(&self, entry: &SnapshotEntry, overwrite: bool) -> Result<ImportOutcome> {
        let node = MetaKey::parse_node(&entry.key)
            .ok_or_else(|| Error::invalid_parameters("malformed node key"))?;
        let end = match MetaKey::classify(&entry.key) {
            KeyKind::NodeEnd => Some(
                keys::decode_u64(&entry.value)
                    .ok_or_else(|| Error::invalid_parameters("malformed node end"))?,
            ),
            _ => {
                NodeBean::from_bytes(&entry.value)?;
                None
            }
        };
        let _commit = self.commit_lock.lock();
        if self.store.contains(&entry.key)? && !overwrite {
            return Ok(ImportOutcome::Skipped);
        }
        let mut batch = WriteBatch::new();
        batch.put(entry.key.as_slice(), entry.value.as_slice());
        self.store.write(batch)?;

        if let Some(end) = end {
            if self.nodes.get(node).is_none() && self.nodes.node_path(node).exists() {
                self.nodes.load(node, end)?;
                debug!("Mapped imported node {}", node);
            }
        }
        Ok(ImportOutcome::Applied)
    }

    fn check_fingerprint(&self, fp: &Fingerprint) -> Result<()> {
        if fp.len() != self.fp_len() {
            return Err(Error::invalid_parameters(format!(
                "fingerprint width {} does not match {}",
                fp.len(),
                self.algo.name()
            )));
        }
        Ok(())
    }

    /// Store one exported file through the normal append path
    pub fn import_file(&self, snapshot: &FileSnapshot) -> Result<ImportOutcome> {
        match self.append(&snapshot.path, &snapshot.data, Some(snapshot.compress)) {
            Ok(_) => Ok(ImportOutcome::Applied),
            Err(Error::AlreadyExists(_)) => Ok(ImportOutcome::Skipped),
            Err(e) => Err(e),
        }
    }
}
