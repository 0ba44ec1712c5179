//! Node file manager
//!
//! Owns every mapped node, tracks which one is active, and keeps a spare
//! node ready so rotation does not stall appenders on file creation.

use crate::node::NodeFile;
use blobnode_common::{Error, NodeId, Result};
use blobnode_meta_store::keys::{self, ACTIVE_NODE};
use blobnode_meta_store::{MetaKey, MetaStore, WriteBatch};
use crossbeam_channel::{Sender, TrySendError};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Attempts at finding an unused node id before giving up
const CREATE_ATTEMPTS: usize = 8;

/// Entries found in the node directory
#[derive(Debug, Default)]
pub struct Discovered {
    /// Files named by a valid node id
    pub nodes: Vec<NodeId>,
    /// `<node>_<suffix>` files left by an interrupted compaction
    pub temps: Vec<(NodeId, PathBuf)>,
}

/// Parameters shared with the pre-allocation worker
#[derive(Clone, Debug)]
struct NodeTemplate {
    dir: PathBuf,
    capacity: u64,
    sync_writes: bool,
}

impl NodeTemplate {
    fn create(&self) -> Result<NodeFile> {
        let mut last_err = None;
        for _ in 0..CREATE_ATTEMPTS {
            let id = NodeId::generate();
            let path = self.dir.join(id.encode());
            if path.exists() {
                continue;
            }
            match NodeFile::create(&path, id, self.capacity, self.sync_writes) {
                Ok(node) => return Ok(node),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::NodeCreateFailed("no free node id".into())))
    }
}

/// Registry of mapped nodes plus the active-node pointer
pub struct NodeManager {
    template: NodeTemplate,
    prealloc_ratio: f64,
    store: Arc<dyn MetaStore>,
    nodes: DashMap<NodeId, Arc<NodeFile>>,
    active: RwLock<Option<Arc<NodeFile>>>,
    prepared: Arc<Mutex<Option<NodeFile>>>,
    rotate_lock: Mutex<()>,
    prealloc_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NodeManager {
    /// Create a manager over `dir`; nodes are loaded separately
    pub fn new(
        dir: impl Into<PathBuf>,
        capacity: u64,
        sync_writes: bool,
        prealloc_ratio: f64,
        store: Arc<dyn MetaStore>,
    ) -> Result<Self> {
        let template = NodeTemplate {
            dir: dir.into(),
            capacity,
            sync_writes,
        };
        std::fs::create_dir_all(&template.dir)?;

        let prepared = Arc::new(Mutex::new(None));
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let worker = {
            let template = template.clone();
            let prepared = Arc::clone(&prepared);
            thread::Builder::new()
                .name("blobnode-prealloc".into())
                .spawn(move || {
                    debug!("Node pre-allocation thread started");
                    // the channel closes on shutdown
                    while rx.recv().is_ok() {
                        if prepared.lock().is_some() {
                            continue;
                        }
                        match template.create() {
                            Ok(node) => {
                                info!("Pre-allocated node {}", node.id());
                                *prepared.lock() = Some(node);
                            }
                            Err(e) => warn!("Node pre-allocation failed: {}", e),
                        }
                    }
                    debug!("Node pre-allocation thread stopped");
                })?
        };

        Ok(Self {
            template,
            prealloc_ratio,
            store,
            nodes: DashMap::new(),
            active: RwLock::new(None),
            prepared,
            rotate_lock: Mutex::new(()),
            prealloc_tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Directory holding node files
    pub fn dir(&self) -> &Path {
        &self.template.dir
    }

    /// Configured capacity of new nodes
    pub const fn capacity(&self) -> u64 {
        self.template.capacity
    }

    /// File path of a node
    pub fn node_path(&self, id: NodeId) -> PathBuf {
        self.template.dir.join(id.encode())
    }

    /// Path of an in-flight compaction output for `id`
    pub fn temp_path(&self, id: NodeId) -> PathBuf {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        self.template.dir.join(format!("{}_{}", id.encode(), &suffix[..8]))
    }

    /// List node files and leftover compaction outputs
    pub fn discover(&self) -> Result<Discovered> {
        let mut found = Discovered::default();
        for entry in std::fs::read_dir(&self.template.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = NodeId::decode(name) {
                found.nodes.push(id);
            } else if let Some((prefix, _)) = name.split_once('_') {
                if let Some(id) = NodeId::decode(prefix) {
                    found.temps.push((id, entry.path()));
                }
            }
        }
        found.nodes.sort();
        Ok(found)
    }

    /// Map an existing node whose committed data ends at `end`
    pub fn load(&self, id: NodeId, end: u64) -> Result<Arc<NodeFile>> {
        let node = NodeFile::open(&self.node_path(id), id, end, self.template.sync_writes)?;
        let node = Arc::new(node);
        self.nodes.insert(id, Arc::clone(&node));
        Ok(node)
    }

    /// Mapped node by id
    pub fn get(&self, id: NodeId) -> Option<Arc<NodeFile>> {
        self.nodes.get(&id).map(|n| Arc::clone(n.value()))
    }

    /// Ids of every mapped node
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|n| *n.key()).collect();
        ids.sort();
        ids
    }

    /// Number of mapped nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Install `node` under its id, returning the mapping it replaced
    pub fn install(&self, node: Arc<NodeFile>) -> Option<Arc<NodeFile>> {
        self.nodes.insert(node.id(), node)
    }

    /// Unmap a node
    pub fn remove(&self, id: NodeId) -> Option<Arc<NodeFile>> {
        self.nodes.remove(&id).map(|(_, node)| node)
    }

    /// Id of the active node, if one has been selected
    pub fn active_id(&self) -> Option<NodeId> {
        self.active.read().as_ref().map(|n| n.id())
    }

    /// The active node
    pub fn active(&self) -> Result<Arc<NodeFile>> {
        self.active
            .read()
            .clone()
            .ok_or_else(|| Error::undefined("no active node"))
    }

    /// Make an already-mapped node the active one (startup)
    pub fn set_active(&self, node: Arc<NodeFile>) {
        *self.active.write() = Some(node);
    }

    /// Create a brand-new node, persist it as active and switch to it
    pub fn activate_new(&self) -> Result<Arc<NodeFile>> {
        let _guard = self.rotate_lock.lock();
        self.activate_locked()
    }

    /// Switch away from `full` unless another thread already has
    ///
    /// Returns the node appends should go to now.
    pub fn rotate(&self, full: NodeId) -> Result<Arc<NodeFile>> {
        let _guard = self.rotate_lock.lock();
        if let Some(current) = self.active.read().clone() {
            if current.id() != full {
                return Ok(current);
            }
        }
        self.activate_locked()
    }

    fn activate_locked(&self) -> Result<Arc<NodeFile>> {
        let node = match self.prepared.lock().take() {
            Some(node) => node,
            None => self.template.create()?,
        };
        let node = Arc::new(node);
        let id = node.id();

        let mut batch = WriteBatch::new();
        batch.put(ACTIVE_NODE, keys::encode_u64(id.as_u64()));
        batch.put(MetaKey::node_end(id), keys::encode_u64(0));
        if let Err(e) = self.store.write(batch) {
            error!("Failed to persist active node {}: {}", id, e);
            // the file is unreferenced; leave it to startup cleanup
            return Err(Error::NodeCreateFailed(format!("persist active node {id}: {e}")));
        }

        if let Some(old) = self.active.read().as_ref() {
            if let Err(e) = old.flush() {
                warn!("Failed to flush node {} on rotation: {}", old.id(), e);
            }
            info!("Rotated active node {} -> {}", old.id(), id);
        } else {
            info!("Activated node {}", id);
        }
        self.nodes.insert(id, Arc::clone(&node));
        *self.active.write() = Some(Arc::clone(&node));
        Ok(node)
    }

    /// Ask the worker for a spare node once the active one is nearly full
    pub fn maybe_prepare(&self, active: &NodeFile) {
        if active.utilization() < self.prealloc_ratio || self.prepared.lock().is_some() {
            return;
        }
        if let Some(tx) = self.prealloc_tx.lock().as_ref() {
            match tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => debug!("Pre-allocation worker is gone"),
            }
        }
    }

    /// Whether a spare node is waiting
    pub fn has_prepared(&self) -> bool {
        self.prepared.lock().is_some()
    }

    /// Flush every mapped node
    pub fn flush_all(&self) -> Result<()> {
        for node in &self.nodes {
            node.value().flush()?;
        }
        Ok(())
    }

    /// Stop the worker, flush and unmap everything
    pub fn shutdown(&self) -> Result<()> {
        drop(self.prealloc_tx.lock().take());
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Node pre-allocation thread panicked");
            }
        }
        let result = self.flush_all();
        // a spare node that never became active is removed
        if let Some(spare) = self.prepared.lock().take() {
            let path = spare.path().to_path_buf();
            drop(spare);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove spare node {:?}: {}", path, e);
            }
        }
        *self.active.write() = None;
        self.nodes.clear();
        result
    }
}

impl Drop for NodeManager {
    fn drop(&mut self) {
        drop(self.prealloc_tx.lock().take());
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}
