//! Blob engine
//!
//! Maps caller paths to content-addressed blobs stored in node files:
//!
//! ```text
//! path --fp--> blob fingerprint --> FileBean --> node record --> payload
//! ```
//!
//! Identical payloads are stored once and reference counted. Every metadata
//! change an operation makes is committed as a single batch.
//!
//! Lock order, outermost first:
//! 1. `gate` (read for every operation, write only to seal a compaction scan
//!    limit and for the swap)
//! 2. path stripes
//! 3. blob stripes
//! 4. `commit_lock` (counters, node bookkeeping and the batch write)

use crate::cache::{ArcCache, RefCounts};
use crate::compress::{codec_for_tag, compress, decompress};
use crate::lock::StripedLock;
use crate::memory::MemoryMonitor;
use crate::node::header_len;
use crate::nodes::NodeManager;
use blobnode_common::{
    Compression, EngineConfig, Error, Fingerprint, FingerprintAlgorithm, MetaBackend, NodeId,
    Result,
};
use blobnode_meta_store::keys::{self, ACTIVE_NODE, FINGERPRINT_ALGO, LIVE_COUNT, SEQUENCE};
use blobnode_meta_store::{
    Bean, Durability, FileBean, MetaKey, MetaStore, NodeBean, PathBean, WriteBatch, open_store,
};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Bytes inspected when deciding whether an unreferenced node file is blank
const BLANK_PROBE: u64 = 4096;

/// A listed path with its content
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    /// Sequence number
    pub id: u64,
    pub path: String,
    pub body: Vec<u8>,
    /// Unix nanoseconds of the last write
    pub timestamp: i64,
}

/// Fragmentation analysis of one node
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FragReport {
    pub node: NodeId,
    /// Size of the node file on disk
    pub file_size: u64,
    /// Committed end offset
    pub committed_size: u64,
    /// Bytes held by dead records
    pub reclaimable_size: u64,
    /// Estimate of bytes held by live records
    pub live_size: u64,
}

/// Engine counters and cache health
#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    pub count: u64,
    pub sequence: u64,
    pub active_node: Option<NodeId>,
    pub nodes: usize,
    pub backend: MetaBackend,
    pub path_cache_hit_ratio: f64,
    pub blob_cache_hit_ratio: f64,
    pub refcount_entries: usize,
    pub memory_over_limit: bool,
}

/// Listing record written by a commit
pub(crate) struct ListingUpdate {
    pub(crate) path: String,
    pub(crate) timestamp: i64,
    /// Sequence number the path was listed under before
    pub(crate) previous: Option<u64>,
}

/// Metadata changes of one operation, applied by [`BlobEngine::commit`]
#[derive(Default)]
pub(crate) struct Pending {
    pub(crate) batch: WriteBatch,
    pub(crate) count_delta: i64,
    /// Bytes that became dead, per node
    pub(crate) reclaim: Vec<(NodeId, u64)>,
    /// New committed end of a node that was appended to
    pub(crate) node_end: Option<(NodeId, u64)>,
    pub(crate) listing: Option<ListingUpdate>,
}

/// Outcome of dropping one reference to a blob
enum Release {
    Decremented(Fingerprint, FileBean, Arc<AtomicI64>),
    Removed(Fingerprint),
    Missing,
}

/// The blob storage engine
pub struct BlobEngine {
    pub(crate) config: EngineConfig,
    pub(crate) algo: FingerprintAlgorithm,
    pub(crate) store: Arc<dyn MetaStore>,
    pub(crate) nodes: NodeManager,
    pub(crate) path_locks: StripedLock,
    pub(crate) blob_locks: StripedLock,
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) gate: RwLock<()>,
    pub(crate) path_cache: ArcCache<Fingerprint, Fingerprint>,
    pub(crate) blob_cache: ArcCache<Fingerprint, FileBean>,
    pub(crate) refcounts: RefCounts<Fingerprint>,
    sequence: AtomicU64,
    count: AtomicU64,
    stopped: AtomicBool,
    memory: MemoryMonitor,
    pub(crate) compacting: Mutex<HashSet<NodeId>>,
}

impl BlobEngine {
    /// Open (or create) the data set described by `config`
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let store = open_store(
            config.meta_backend,
            &config.meta_dir(),
            Durability::from_sync_writes(config.sync_writes),
        )?;
        Self::pin_fingerprint(store.as_ref(), config.fingerprint)?;
        let sequence = read_u64(store.as_ref(), SEQUENCE)?.unwrap_or(0);
        let count = read_u64(store.as_ref(), LIVE_COUNT)?.unwrap_or(0);

        let nodes = NodeManager::new(
            config.nodes_dir(),
            config.node_capacity,
            config.sync_writes,
            config.prealloc_ratio,
            Arc::clone(&store),
        )?;
        let memory = match config.memory_limit_percent {
            Some(limit) => MemoryMonitor::start(
                limit,
                Duration::from_millis(config.memory_sample_interval_ms),
            )?,
            None => MemoryMonitor::disabled(),
        };

        let engine = Self {
            algo: config.fingerprint,
            store,
            nodes,
            path_locks: StripedLock::new(config.lock_stripes),
            blob_locks: StripedLock::new(config.lock_stripes),
            commit_lock: Mutex::new(()),
            gate: RwLock::new(()),
            path_cache: ArcCache::new(config.meta_cache_entries),
            blob_cache: ArcCache::new(config.meta_cache_entries),
            refcounts: RefCounts::new(config.refcount_cache_entries),
            sequence: AtomicU64::new(sequence),
            count: AtomicU64::new(count),
            stopped: AtomicBool::new(false),
            memory,
            compacting: Mutex::new(HashSet::new()),
            config,
        };

        for node in engine.recover_nodes()? {
            info!("Re-running interrupted compaction of node {}", node);
            if let Err(e) = engine.defragment(node) {
                warn!("Compaction of node {} failed during recovery: {}", node, e);
            }
        }

        info!(
            "Opened blob engine at {:?}: {} objects, {} nodes, active node {:?}",
            engine.config.data_dir,
            engine.count(),
            engine.nodes.len(),
            engine.nodes.active_id()
        );
        Ok(engine)
    }

    /// Record the fingerprint algorithm on first open, verify it afterwards
    fn pin_fingerprint(store: &dyn MetaStore, algo: FingerprintAlgorithm) -> Result<()> {
        match store.get(FINGERPRINT_ALGO)? {
            None => {
                store.put(FINGERPRINT_ALGO, algo.name().as_bytes())?;
                Ok(())
            }
            Some(name) if name == algo.name().as_bytes() => Ok(()),
            Some(name) => Err(Error::Configuration(format!(
                "data set was created with fingerprint {}, configured {}",
                String::from_utf8_lossy(&name),
                algo.name()
            ))),
        }
    }

    /// Map existing nodes, clean up leftovers and select the active node
    ///
    /// Returns nodes whose compaction was interrupted and should be re-run.
    fn recover_nodes(&self) -> Result<Vec<NodeId>> {
        self.finish_pending_swaps()?;
        let found = self.nodes.discover()?;

        let mut redo = Vec::new();
        for (id, temp) in found.temps {
            warn!("Removing interrupted compaction output {:?}", temp);
            std::fs::remove_file(&temp)?;
            redo.push(id);
        }

        let active = read_u64(self.store.as_ref(), ACTIVE_NODE)?.map(NodeId::from);
        let mut stale = WriteBatch::new();
        for id in found.nodes {
            let is_active = active == Some(id);
            let end = read_u64(self.store.as_ref(), MetaKey::node_end(id).as_bytes())?;
            match end {
                Some(end) if end > 0 || is_active => {
                    self.nodes.load(id, end)?;
                }
                _ => {
                    let path = self.nodes.node_path(id);
                    if is_blank_file(&path)? {
                        info!("Removing unused node file {:?}", path);
                        std::fs::remove_file(&path)?;
                        stale.delete(MetaKey::node(id));
                        stale.delete(MetaKey::node_end(id));
                    } else {
                        warn!("Node file {:?} has no committed data, leaving it untouched", path);
                    }
                }
            }
        }
        self.store.write(stale)?;

        match active.and_then(|id| self.nodes.get(id)) {
            Some(node) => {
                node.recover_tail(self.fp_len());
                self.nodes.set_active(node);
            }
            None => {
                if let Some(id) = active {
                    warn!("Active node {} is missing, starting a new one", id);
                }
                self.nodes.activate_new()?;
            }
        }

        let active = self.nodes.active_id();
        redo.retain(|id| Some(*id) != active && self.nodes.get(*id).is_some());
        redo.sort();
        redo.dedup();
        Ok(redo)
    }

    pub(crate) const fn fp_len(&self) -> usize {
        self.algo.len()
    }

    /// Fail fast once the engine is stopping
    pub(crate) fn check_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::ServiceStopped);
        }
        Ok(())
    }

    /// Start an operation: take the gate for read and re-check the stop flag
    pub(crate) fn enter(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.check_running()?;
        let gate = self.gate.read();
        self.check_running()?;
        Ok(gate)
    }

    fn check_path(path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(Error::invalid_parameters("empty path"));
        }
        Ok(())
    }

    fn require_listing(&self) -> Result<()> {
        if !self.config.listing {
            return Err(Error::invalid_parameters("listing mode is disabled"));
        }
        Ok(())
    }

    // ---- metadata helpers -------------------------------------------------

    pub(crate) fn load_path(&self, path_fp: &Fingerprint) -> Result<Option<Fingerprint>> {
        Ok(self
            .store
            .get(MetaKey::path(path_fp).as_bytes())?
            .map(|bytes| Fingerprint::from_bytes(&bytes)))
    }

    pub(crate) fn load_file_bean(&self, blob_fp: &Fingerprint) -> Result<Option<FileBean>> {
        match self.store.get(MetaKey::blob(blob_fp).as_bytes())? {
            Some(bytes) => Ok(Some(FileBean::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn load_path_seq(&self, path: &str) -> Result<Option<u64>> {
        match self.store.get(MetaKey::path_name(path).as_bytes())? {
            Some(bytes) => keys::decode_u64(&bytes)
                .map(Some)
                .ok_or_else(|| Error::corruption(format!("sequence of {path} is malformed"))),
            None => Ok(None),
        }
    }

    pub(crate) fn load_path_bean(&self, seq: u64) -> Result<Option<PathBean>> {
        match self.store.get(MetaKey::path_seq(seq).as_bytes())? {
            Some(bytes) => Ok(Some(PathBean::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn load_node_bean(&self, node: NodeId) -> Result<NodeBean> {
        match self.store.get(MetaKey::node(node).as_bytes())? {
            Some(bytes) => Ok(NodeBean::from_bytes(&bytes)?),
            None => Ok(NodeBean::default()),
        }
    }

    pub(crate) fn load_node_end(&self, node: NodeId) -> Result<Option<u64>> {
        read_u64(self.store.as_ref(), MetaKey::node_end(node).as_bytes())
    }

    /// Path lookup through the cache; misses fill it under the path stripe
    fn resolve_path(&self, path_fp: &Fingerprint) -> Result<Option<Fingerprint>> {
        if let Some(blob_fp) = self.path_cache.get(path_fp) {
            return Ok(Some(blob_fp));
        }
        let _guard = self.path_locks.lock(path_fp);
        let blob_fp = self.load_path(path_fp)?;
        if let Some(blob_fp) = &blob_fp {
            self.path_cache.put(path_fp.clone(), blob_fp.clone());
        }
        Ok(blob_fp)
    }

    /// Blob lookup through the cache; misses fill it under the blob stripe
    fn resolve_blob(&self, blob_fp: &Fingerprint) -> Result<Option<FileBean>> {
        if let Some(bean) = self.blob_cache.get(blob_fp) {
            return Ok(Some(bean));
        }
        let _guard = self.blob_locks.lock(blob_fp);
        let bean = self.load_file_bean(blob_fp)?;
        if let Some(bean) = &bean {
            self.blob_cache.put(blob_fp.clone(), bean.clone());
        }
        Ok(bean)
    }

    /// Apply `pending` as one batch under the commit lock
    ///
    /// Allocates the sequence number, moves the live counter, credits dead
    /// bytes to their nodes and advances the node's committed end. In-memory
    /// counters change only once the batch is durable in the store.
    pub(crate) fn commit(&self, mut pending: Pending) -> Result<Option<u64>> {
        let _commit = self.commit_lock.lock();
        let batch = &mut pending.batch;

        let mut seq = None;
        if let Some(update) = pending.listing.take() {
            let next = self.sequence.load(Ordering::Acquire) + 1;
            if let Some(previous) = update.previous {
                batch.delete(MetaKey::path_seq(previous));
            }
            let bean = PathBean {
                path: update.path,
                timestamp: update.timestamp,
            };
            batch.put(MetaKey::path_seq(next), bean.to_bytes()?);
            batch.put(MetaKey::path_name(&bean.path), keys::encode_u64(next));
            batch.put(SEQUENCE, keys::encode_u64(next));
            seq = Some(next);
        }

        let mut count = None;
        if pending.count_delta != 0 {
            let next = self
                .count
                .load(Ordering::Acquire)
                .saturating_add_signed(pending.count_delta);
            batch.put(LIVE_COUNT, keys::encode_u64(next));
            count = Some(next);
        }

        let mut credits: HashMap<NodeId, u64> = HashMap::new();
        for (node, bytes) in pending.reclaim {
            *credits.entry(node).or_default() += bytes;
        }
        for (node, bytes) in credits {
            let mut bean = self.load_node_bean(node)?;
            bean.reclaimable_size += bytes;
            batch.put(MetaKey::node(node), bean.to_bytes()?);
        }

        if let Some((node, end)) = pending.node_end {
            // appends may commit out of order; the end only moves forward
            if self.load_node_end(node)?.is_none_or(|current| end > current) {
                batch.put(MetaKey::node_end(node), keys::encode_u64(end));
            }
        }

        self.store.write(pending.batch)?;
        if let Some(seq) = seq {
            self.sequence.store(seq, Ordering::Release);
        }
        if let Some(count) = count {
            self.count.store(count, Ordering::Release);
        }
        Ok(seq)
    }

    /// Drop one reference to `blob_fp`, staging the change in `pending`
    ///
    /// Caller holds the blob's stripe lock.
    fn release_blob(&self, blob_fp: &Fingerprint, pending: &mut Pending) -> Result<Release> {
        let Some(mut bean) = self.load_file_bean(blob_fp)? else {
            warn!("Blob {} is referenced but has no record", blob_fp);
            return Ok(Release::Missing);
        };
        let counter = self.refcounts.counter(blob_fp, || bean.refcount);
        let remaining = counter.load(Ordering::Acquire) - 1;
        if remaining <= 0 {
            pending.batch.delete(MetaKey::blob(blob_fp));
            pending
                .reclaim
                .push((bean.storenode, bean.record_len(self.fp_len())));
            Ok(Release::Removed(blob_fp.clone()))
        } else {
            bean.refcount = remaining;
            pending.batch.put(MetaKey::blob(blob_fp), bean.to_bytes()?);
            Ok(Release::Decremented(blob_fp.clone(), bean, counter))
        }
    }

    /// Publish a committed release to the in-memory caches
    fn apply_release(&self, release: Release) {
        match release {
            Release::Decremented(blob_fp, bean, counter) => {
                counter.store(bean.refcount, Ordering::Release);
                self.blob_cache.put(blob_fp, bean);
            }
            Release::Removed(blob_fp) => {
                self.refcounts.invalidate(&blob_fp);
                self.blob_cache.remove(&blob_fp);
            }
            Release::Missing => {}
        }
    }

    /// Compress `data` and append it to the active node, rotating as needed
    fn store_payload(
        &self,
        blob_fp: &Fingerprint,
        data: &[u8],
        codec: Compression,
    ) -> Result<FileBean> {
        let payload = compress(codec, data)?;
        let header = header_len(self.fp_len()) as u64;
        if header + payload.len() as u64 > self.nodes.capacity() {
            return Err(Error::OversizeObject {
                size: payload.len() as u64,
                max: self.nodes.capacity() - header,
            });
        }

        let mut node = self.nodes.active()?;
        let mut retried = false;
        loop {
            match node.append_record(blob_fp, &payload) {
                Ok(Some(offset)) => {
                    self.nodes.maybe_prepare(&node);
                    return Ok(FileBean {
                        storenode: node.id(),
                        offset,
                        size: payload.len() as u64,
                        compress: codec.tag(),
                        refcount: 0,
                    });
                }
                Ok(None) => {
                    debug!("Node {} is full, rotating", node.id());
                    node = self.nodes.rotate(node.id())?;
                }
                Err(e) if e.is_node_append_failure() && !retried => {
                    warn!("Append to node {} failed ({}), retrying on a new node", node.id(), e);
                    retried = true;
                    node = self.nodes.rotate(node.id())?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read and decode the payload a FileBean describes
    pub(crate) fn read_blob(&self, blob_fp: &Fingerprint, bean: &FileBean) -> Result<Vec<u8>> {
        let node = self.nodes.get(bean.storenode).ok_or_else(|| {
            Error::corruption(format!("node {} of blob {} is not mapped", bean.storenode, blob_fp))
        })?;
        let payload = node.read_record(bean.offset, blob_fp, bean.size)?;
        let codec = Compression::from_tag(bean.compress).ok_or_else(|| {
            Error::corruption(format!("blob {} has unknown codec {}", blob_fp, bean.compress))
        })?;
        decompress(codec, &payload)
    }

    // ---- operations --------------------------------------------------------

    /// Store `data` under `path`
    ///
    /// Returns the path's new sequence number in listing mode. Fails with
    /// `AlreadyExists` when the path already holds identical content.
    pub fn append(&self, path: &str, data: &[u8], compress: Option<i32>) -> Result<Option<u64>> {
        self.check_running()?;
        Self::check_path(path)?;
        if data.is_empty() {
            return Err(Error::invalid_parameters("empty payload"));
        }
        let max = self.config.effective_max_object_size();
        if data.len() as u64 > max {
            return Err(Error::OversizeObject {
                size: data.len() as u64,
                max,
            });
        }
        let codec = codec_for_tag(compress.unwrap_or(self.config.default_compression))?;

        let _gate = self.enter()?;
        let path_fp = self.algo.digest(path.as_bytes());
        let blob_fp = self.algo.digest(data);
        let _path_guard = self.path_locks.lock(&path_fp);

        let previous = self.load_path(&path_fp)?;
        if previous.as_ref() == Some(&blob_fp) {
            return Err(Error::AlreadyExists(path.to_string()));
        }
        let _blob_guards = self
            .blob_locks
            .lock_many(std::iter::once(&blob_fp).chain(previous.as_ref()));

        let mut pending = Pending::default();
        let mut bean = if let Some(bean) = self.load_file_bean(&blob_fp)? {
            debug!("Dedup hit for {} on blob {}", path, blob_fp);
            bean
        } else {
            let bean = self.store_payload(&blob_fp, data, codec)?;
            pending.node_end = Some((bean.storenode, bean.offset + bean.record_len(self.fp_len())));
            bean
        };
        let counter = self.refcounts.counter(&blob_fp, || bean.refcount);
        bean.refcount = counter.load(Ordering::Acquire) + 1;
        pending.batch.put(MetaKey::blob(&blob_fp), bean.to_bytes()?);

        let release = match &previous {
            Some(old) => self.release_blob(old, &mut pending)?,
            None => Release::Missing,
        };
        pending.batch.put(MetaKey::path(&path_fp), blob_fp.as_bytes());
        if previous.is_none() {
            pending.count_delta = 1;
        }
        if self.config.listing {
            pending.listing = Some(ListingUpdate {
                path: path.to_string(),
                timestamp: now_nanos(),
                previous: self.load_path_seq(path)?,
            });
        }

        match self.commit(pending) {
            Ok(seq) => {
                counter.store(bean.refcount, Ordering::Release);
                self.apply_release(release);
                self.path_cache.put(path_fp, blob_fp.clone());
                self.blob_cache.put(blob_fp, bean);
                Ok(seq)
            }
            Err(e) => {
                error!("Append of {} failed to commit: {}", path, e);
                self.refcounts.invalidate(&blob_fp);
                if let Some(old) = &previous {
                    self.refcounts.invalidate(old);
                }
                Err(e)
            }
        }
    }

    /// Content stored under `path`
    pub fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.check_running()?;
        Self::check_path(path)?;
        self.memory.backoff();
        self.read_path(path)
    }

    pub(crate) fn read_path(&self, path: &str) -> Result<Vec<u8>> {
        let _gate = self.enter()?;
        let path_fp = self.algo.digest(path.as_bytes());
        let blob_fp = self
            .resolve_path(&path_fp)?
            .ok_or_else(|| Error::not_found(path))?;
        let bean = self
            .resolve_blob(&blob_fp)?
            .ok_or_else(|| Error::not_found(path))?;
        self.read_blob(&blob_fp, &bean).inspect_err(|e| {
            error!("Read of {} (blob {}, node {}) failed: {}", path, blob_fp, bean.storenode, e);
        })
    }

    /// Whether `path` is mapped
    pub fn exists(&self, path: &str) -> Result<bool> {
        Self::check_path(path)?;
        let _gate = self.enter()?;
        let path_fp = self.algo.digest(path.as_bytes());
        Ok(self.resolve_path(&path_fp)?.is_some())
    }

    /// Remove `path`, reclaiming its blob when no other path references it
    pub fn delete(&self, path: &str) -> Result<()> {
        self.check_running()?;
        Self::check_path(path)?;
        let _gate = self.enter()?;
        let path_fp = self.algo.digest(path.as_bytes());
        let _path_guard = self.path_locks.lock(&path_fp);

        let blob_fp = self
            .load_path(&path_fp)?
            .ok_or_else(|| Error::not_found(path))?;
        let _blob_guard = self.blob_locks.lock(&blob_fp);

        let mut pending = Pending::default();
        let release = self.release_blob(&blob_fp, &mut pending)?;
        pending.batch.delete(MetaKey::path(&path_fp));
        pending.count_delta = -1;
        if let Some(seq) = self.load_path_seq(path)? {
            pending.batch.delete(MetaKey::path_seq(seq));
            pending.batch.delete(MetaKey::path_name(path));
        }

        match self.commit(pending) {
            Ok(_) => {
                self.apply_release(release);
                self.path_cache.remove(&path_fp);
                Ok(())
            }
            Err(e) => {
                error!("Delete of {} failed to commit: {}", path, e);
                self.refcounts.invalidate(&blob_fp);
                Err(e)
            }
        }
    }

    /// Move the mapping of `from` to `to`; the blob is untouched
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.check_running()?;
        Self::check_path(from)?;
        Self::check_path(to)?;
        if from == to {
            return Err(Error::invalid_parameters("source and destination are the same"));
        }

        let _gate = self.enter()?;
        let from_fp = self.algo.digest(from.as_bytes());
        let to_fp = self.algo.digest(to.as_bytes());
        let _path_guards = self.path_locks.lock_many([&from_fp, &to_fp]);

        let blob_fp = self
            .load_path(&from_fp)?
            .ok_or_else(|| Error::not_found(from))?;
        if self.load_path(&to_fp)?.is_some() {
            return Err(Error::ConflictingDestination(to.to_string()));
        }

        let mut pending = Pending::default();
        pending.batch.delete(MetaKey::path(&from_fp));
        pending.batch.put(MetaKey::path(&to_fp), blob_fp.as_bytes());
        if let Some(seq) = self.load_path_seq(from)? {
            let timestamp = self
                .load_path_bean(seq)?
                .map_or_else(now_nanos, |bean| bean.timestamp);
            let bean = PathBean {
                path: to.to_string(),
                timestamp,
            };
            pending.batch.delete(MetaKey::path_name(from));
            pending.batch.put(MetaKey::path_name(to), keys::encode_u64(seq));
            pending.batch.put(MetaKey::path_seq(seq), bean.to_bytes()?);
        }

        self.commit(pending).inspect_err(|e| {
            error!("Rename of {} to {} failed to commit: {}", from, to, e);
        })?;
        self.path_cache.remove(&from_fp);
        self.path_cache.put(to_fp, blob_fp);
        Ok(())
    }

    /// Listing entry for a sequence number, `None` for holes
    fn path_entry(&self, seq: u64) -> Result<Option<PathEntry>> {
        let Some(bean) = self.load_path_bean(seq)? else {
            return Ok(None);
        };
        match self.read_path(&bean.path) {
            Ok(body) => Ok(Some(PathEntry {
                id: seq,
                path: bean.path,
                body,
                timestamp: bean.timestamp,
            })),
            Err(e) if e.is_not_found() => {
                warn!("Listed path {} (seq {}) no longer resolves", bean.path, seq);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Every listed path starting with `prefix`, in path order
    pub fn list_by_prefix(&self, prefix: &str) -> Result<Vec<PathEntry>> {
        self.check_running()?;
        self.require_listing()?;
        self.memory.backoff();
        let rows = self
            .store
            .scan_prefix(MetaKey::path_name(prefix).as_bytes(), None)?;
        let mut entries = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let Some(seq) = keys::decode_u64(&value) else {
                warn!("Malformed listing index entry {:?}", String::from_utf8_lossy(&key));
                continue;
            };
            if let Some(entry) = self.path_entry(seq)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Up to `limit` listed paths, newest first, starting at sequence `start`
    ///
    /// `start == 0` starts from the newest path.
    pub fn list_by_range(&self, start: u64, limit: usize) -> Result<Vec<PathEntry>> {
        self.check_running()?;
        self.require_listing()?;
        self.memory.backoff();
        let newest = self.sequence();
        let top = if start == 0 { newest } else { start.min(newest) };
        let mut entries = Vec::new();
        for seq in (1..=top).rev() {
            if entries.len() >= limit {
                break;
            }
            if let Some(entry) = self.path_entry(seq)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    // ---- introspection -----------------------------------------------------

    /// Number of live paths
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Last allocated sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Node currently accepting appends
    pub fn active_node(&self) -> Option<NodeId> {
        self.nodes.active_id()
    }

    /// Every mapped node
    pub fn nodes(&self) -> Vec<NodeId> {
        self.nodes.ids()
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fingerprint of `data` under the engine's algorithm
    pub fn fingerprint(&self, data: &[u8]) -> Fingerprint {
        self.algo.digest(data)
    }

    /// Stored record of a blob
    pub fn file_bean(&self, blob_fp: &Fingerprint) -> Result<Option<FileBean>> {
        self.load_file_bean(blob_fp)
    }

    /// Stored record of the blob `path` maps to
    pub fn file_bean_of(&self, path: &str) -> Result<Option<FileBean>> {
        let path_fp = self.algo.digest(path.as_bytes());
        match self.load_path(&path_fp)? {
            Some(blob_fp) => self.load_file_bean(&blob_fp),
            None => Ok(None),
        }
    }

    /// Stored bookkeeping of a node
    pub fn node_bean(&self, node: NodeId) -> Result<NodeBean> {
        self.load_node_bean(node)
    }

    /// Committed end offset of a node
    pub fn node_end(&self, node: NodeId) -> Result<Option<u64>> {
        self.load_node_end(node)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            count: self.count(),
            sequence: self.sequence(),
            active_node: self.nodes.active_id(),
            nodes: self.nodes.len(),
            backend: self.store.backend(),
            path_cache_hit_ratio: self.path_cache.stats().hit_ratio(),
            blob_cache_hit_ratio: self.blob_cache.stats().hit_ratio(),
            refcount_entries: self.refcounts.len(),
            memory_over_limit: self.memory.is_over_limit(),
        }
    }

    /// Stop accepting operations, wait for in-flight ones and flush
    pub fn close(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _gate = self.gate.write();
        self.memory.stop();
        let nodes = self.nodes.shutdown();
        let meta = self.store.flush();
        info!("Blob engine at {:?} closed", self.config.data_dir);
        nodes?;
        meta?;
        Ok(())
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for BlobEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close blob engine: {}", e);
        }
    }
}

pub(crate) fn read_u64(store: &dyn MetaStore, key: &[u8]) -> Result<Option<u64>> {
    match store.get(key)? {
        Some(bytes) => keys::decode_u64(&bytes).map(Some).ok_or_else(|| {
            Error::corruption(format!(
                "value of {:?} is not a u64",
                String::from_utf8_lossy(key)
            ))
        }),
        None => Ok(None),
    }
}

pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// Whether the first bytes of a file are all zero
fn is_blank_file(path: &Path) -> Result<bool> {
    let mut probe = Vec::new();
    std::fs::File::open(path)?
        .take(BLANK_PROBE)
        .read_to_end(&mut probe)?;
    Ok(probe.iter().all(|&b| b == 0))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use blobnode_common::ErrorKind;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    pub(crate) fn test_config(dir: &Path) -> EngineConfig {
        EngineConfig {
            node_capacity: 64 * 1024,
            max_object_size: 16 * 1024,
            meta_cache_entries: 64,
            refcount_cache_entries: 16,
            lock_stripes: 16,
            ..EngineConfig::with_data_dir(dir)
        }
    }

    pub(crate) fn random_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
        (0..len).map(|_| rng.r#gen()).collect()
    }

    #[test]
    fn test_append_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(test_config(dir.path())).unwrap();
        for tag in [0, 1, 2, 3, 11] {
            let path = format!("/codec/{tag}");
            let data = format!("payload for codec {tag} ").repeat(50);
            engine.append(&path, data.as_bytes(), Some(tag)).unwrap();
            assert_eq!(engine.get(&path).unwrap(), data.as_bytes());
            assert_eq!(engine.file_bean_of(&path).unwrap().unwrap().compress, tag);
        }
        assert_eq!(engine.count(), 5);
        assert!(engine.exists("/codec/0").unwrap());
        assert!(!engine.exists("/codec/99").unwrap());
    }

    #[test]
    fn test_concrete_dedup_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(test_config(dir.path())).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let data = random_bytes(&mut rng, 1024);
        let blob_fp = engine.fingerprint(&data);

        engine.append("/a/b.jpg", &data, Some(0)).unwrap();
        assert_eq!(engine.get("/a/b.jpg").unwrap(), data);
        let node = engine.active_node().unwrap();
        let end_after_first = engine.node_end(node).unwrap().unwrap();

        engine.append("/a/c.jpg", &data, Some(0)).unwrap();
        assert_eq!(engine.file_bean(&blob_fp).unwrap().unwrap().refcount, 2);
        assert_eq!(engine.node_end(node).unwrap().unwrap(), end_after_first);

        engine.delete("/a/b.jpg").unwrap();
        assert_eq!(engine.file_bean(&blob_fp).unwrap().unwrap().refcount, 1);
        assert_eq!(engine.get("/a/b.jpg").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(engine.get("/a/c.jpg").unwrap(), data);

        engine.delete("/a/c.jpg").unwrap();
        assert!(engine.file_bean(&blob_fp).unwrap().is_none());
        assert_eq!(engine.node_bean(node).unwrap().reclaimable_size, 1024 + 8 + 4);
        assert_eq!(engine.count(), 0);
    }

    #[test]
    fn test_append_same_content_twice_is_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(test_config(dir.path())).unwrap();
        engine.append("/x", b"same", None).unwrap();
        let err = engine.append("/x", b"same", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(engine.file_bean_of("/x").unwrap().unwrap().refcount, 1);
        assert_eq!(engine.count(), 1);
    }

    #[test]
    fn test_overwrite_releases_old_blob() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(test_config(dir.path())).unwrap();
        let old_fp = engine.fingerprint(b"version one");
        let seq1 = engine.append("/doc", b"version one", Some(0)).unwrap();
        let seq2 = engine.append("/doc", b"version two", Some(0)).unwrap();
        assert!(seq2 > seq1);
        assert_eq!(engine.get("/doc").unwrap(), b"version two");
        assert!(engine.file_bean(&old_fp).unwrap().is_none());
        assert_eq!(engine.count(), 1);

        let node = engine.active_node().unwrap();
        assert_eq!(engine.node_bean(node).unwrap().reclaimable_size, 11 + 12);
        // the path is listed once, under its newest sequence number
        let listed = engine.list_by_range(0, 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, seq2.unwrap());
    }

    #[test]
    fn test_parameter_validation() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(test_config(dir.path())).unwrap();
        let kind = |r: Result<Option<u64>>| r.unwrap_err().kind();
        assert_eq!(kind(engine.append("", b"x", None)), ErrorKind::InvalidParameters);
        assert_eq!(kind(engine.append("/p", b"", None)), ErrorKind::InvalidParameters);
        assert_eq!(kind(engine.append("/p", b"x", Some(99))), ErrorKind::InvalidParameters);
        assert_eq!(
            kind(engine.append("/p", &vec![1u8; 16 * 1024 + 1], None)),
            ErrorKind::OversizeObject
        );
        assert_eq!(engine.delete("/missing").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_rename() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(test_config(dir.path())).unwrap();
        let seq = engine.append("/old", b"content", None).unwrap().unwrap();
        engine.append("/taken", b"other", None).unwrap();

        assert_eq!(
            engine.rename("/old", "/taken").unwrap_err().kind(),
            ErrorKind::ConflictingDestination
        );
        assert_eq!(
            engine.rename("/old", "/old").unwrap_err().kind(),
            ErrorKind::InvalidParameters
        );
        assert_eq!(
            engine.rename("/nope", "/new").unwrap_err().kind(),
            ErrorKind::NotFound
        );

        engine.rename("/old", "/new").unwrap();
        assert_eq!(engine.get("/new").unwrap(), b"content");
        assert!(!engine.exists("/old").unwrap());
        assert_eq!(engine.file_bean_of("/new").unwrap().unwrap().refcount, 1);
        assert_eq!(engine.count(), 2);

        let listed = engine.list_by_prefix("/new").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, seq);
        assert!(engine.list_by_prefix("/old").unwrap().is_empty());
    }

    #[test]
    fn test_listing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(test_config(dir.path())).unwrap();
        for i in 0..10 {
            let path = format!("/img/{i:02}.jpg");
            engine.append(&path, path.as_bytes(), None).unwrap();
        }
        engine.append("/doc/readme", b"hello", None).unwrap();
        engine.delete("/img/05.jpg").unwrap();

        let imgs = engine.list_by_prefix("/img/").unwrap();
        assert_eq!(imgs.len(), 9);
        assert_eq!(imgs[0].path, "/img/00.jpg");
        assert_eq!(imgs[0].body, b"/img/00.jpg");

        // newest first, skipping the deleted sequence
        let page = engine.list_by_range(7, 3).unwrap();
        let ids: Vec<u64> = page.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![7, 5, 4]);
        let all = engine.list_by_range(0, 100).unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].path, "/doc/readme");
    }

    #[test]
    fn test_listing_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            listing: false,
            ..test_config(dir.path())
        };
        let engine = BlobEngine::open(config).unwrap();
        assert_eq!(engine.append("/a", b"1", None).unwrap(), None);
        assert_eq!(engine.sequence(), 0);
        assert_eq!(
            engine.list_by_prefix("/").unwrap_err().kind(),
            ErrorKind::InvalidParameters
        );
        engine.delete("/a").unwrap();
    }

    #[test]
    fn test_capacity_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            node_capacity: 4096,
            ..test_config(dir.path())
        };
        let engine = BlobEngine::open(config).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let mut stored = Vec::new();
        for i in 0..12 {
            let data = random_bytes(&mut rng, 1000);
            let path = format!("/blob/{i}");
            engine.append(&path, &data, Some(0)).unwrap();
            stored.push((path, data));
        }
        assert!(engine.nodes().len() >= 3);
        for (path, data) in &stored {
            assert_eq!(&engine.get(path).unwrap(), data);
        }
        for node in engine.nodes() {
            if let Some(end) = engine.node_end(node).unwrap() {
                assert!(end <= 4096);
            }
        }
        // a payload that can never fit one node
        let err = engine.append("/huge", &random_bytes(&mut rng, 4090), Some(0));
        assert_eq!(err.unwrap_err().kind(), ErrorKind::OversizeObject);
    }

    #[test]
    fn test_reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let active;
        {
            let engine = BlobEngine::open(test_config(dir.path())).unwrap();
            engine.append("/keep", b"persistent", None).unwrap();
            engine.append("/gone", b"temporary", None).unwrap();
            engine.delete("/gone").unwrap();
            active = engine.active_node();
            engine.close().unwrap();
            assert_eq!(engine.get("/keep").unwrap_err().kind(), ErrorKind::ServiceStopped);
        }
        let engine = BlobEngine::open(test_config(dir.path())).unwrap();
        assert_eq!(engine.get("/keep").unwrap(), b"persistent");
        assert!(!engine.exists("/gone").unwrap());
        assert_eq!(engine.count(), 1);
        assert_eq!(engine.sequence(), 2);
        assert_eq!(engine.active_node(), active);
        // appends continue after the recovered end
        engine.append("/more", b"after reopen", None).unwrap();
        assert_eq!(engine.get("/keep").unwrap(), b"persistent");
    }

    #[test]
    fn test_fingerprint_is_pinned() {
        let dir = tempfile::tempdir().unwrap();
        drop(BlobEngine::open(test_config(dir.path())).unwrap());
        let config = EngineConfig {
            fingerprint: FingerprintAlgorithm::Sha256,
            ..test_config(dir.path())
        };
        assert!(matches!(
            BlobEngine::open(config),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_sqlite_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            meta_backend: MetaBackend::Sqlite,
            fingerprint: FingerprintAlgorithm::Sha1,
            ..test_config(dir.path())
        };
        let engine = BlobEngine::open(config).unwrap();
        engine.append("/s/1", b"shared", None).unwrap();
        engine.append("/s/2", b"shared", None).unwrap();
        assert_eq!(engine.file_bean_of("/s/1").unwrap().unwrap().refcount, 2);
        engine.rename("/s/2", "/s/3").unwrap();
        assert_eq!(engine.list_by_prefix("/s/").unwrap().len(), 2);
        assert_eq!(engine.stats().backend, MetaBackend::Sqlite);
    }

    /// Reference counts always equal the number of paths mapped to a blob
    fn assert_refcounts(
        engine: &BlobEngine,
        model: &BTreeMap<String, Vec<u8>>,
        contents: &[Vec<u8>],
    ) {
        for content in contents {
            let expected = model.values().filter(|v| *v == content).count() as i64;
            let bean = engine.file_bean(&engine.fingerprint(content)).unwrap();
            match bean {
                Some(bean) => {
                    assert!(bean.refcount > 0);
                    assert_eq!(bean.refcount, expected);
                }
                None => assert_eq!(expected, 0),
            }
        }
        assert_eq!(engine.count(), model.len() as u64);
    }

    #[test]
    fn test_refcounts_under_random_operations() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::open(test_config(dir.path())).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let paths: Vec<String> = (0..6).map(|i| format!("/r/{i}")).collect();
        let contents: Vec<Vec<u8>> = (0..3).map(|i| vec![i as u8 + 1; 64]).collect();
        let mut model: BTreeMap<String, Vec<u8>> = BTreeMap::new();

        for _ in 0..500 {
            let path = &paths[rng.gen_range(0..paths.len())];
            match rng.gen_range(0..3) {
                0 => {
                    let content = &contents[rng.gen_range(0..contents.len())];
                    match engine.append(path, content, None) {
                        Ok(_) => {
                            model.insert(path.clone(), content.clone());
                        }
                        Err(e) => {
                            assert_eq!(e.kind(), ErrorKind::AlreadyExists);
                            assert_eq!(model.get(path), Some(content));
                        }
                    }
                }
                1 => match engine.delete(path) {
                    Ok(()) => {
                        model.remove(path);
                    }
                    Err(e) => {
                        assert_eq!(e.kind(), ErrorKind::NotFound);
                        assert!(!model.contains_key(path));
                    }
                },
                _ => {
                    let to = &paths[rng.gen_range(0..paths.len())];
                    match engine.rename(path, to) {
                        Ok(()) => {
                            let content = model.remove(path).unwrap();
                            model.insert(to.clone(), content);
                        }
                        Err(e) => assert!(matches!(
                            e.kind(),
                            ErrorKind::NotFound
                                | ErrorKind::ConflictingDestination
                                | ErrorKind::InvalidParameters
                        )),
                    }
                }
            }
            assert_refcounts(&engine, &model, &contents);
        }
        for (path, content) in &model {
            assert_eq!(&engine.get(path).unwrap(), content);
        }
    }

    #[test]
    fn test_refcounts_under_concurrent_operations() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(BlobEngine::open(test_config(dir.path())).unwrap());
        let contents: Vec<Vec<u8>> = (0..4).map(|i| vec![i as u8 + 10; 100]).collect();

        let handles: Vec<_> = (0..6u64)
            .map(|t| {
                let engine = Arc::clone(&engine);
                let contents = contents.clone();
                std::thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(100 + t);
                    for _ in 0..200 {
                        let path = format!("/c/{}", rng.gen_range(0..8));
                        if rng.gen_bool(0.7) {
                            let content = &contents[rng.gen_range(0..contents.len())];
                            let _ = engine.append(&path, content, None);
                        } else {
                            let _ = engine.delete(&path);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut model = BTreeMap::new();
        for i in 0..8 {
            let path = format!("/c/{i}");
            if let Ok(content) = engine.get(&path) {
                model.insert(path, content);
            }
        }
        assert_refcounts(&engine, &model, &contents);
    }
}
