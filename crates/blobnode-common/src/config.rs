//! Engine configuration
//!
//! A single [`EngineConfig`] is handed to the engine at startup. Every field
//! has a serde default so partial TOML files deserialize cleanly.

use crate::error::{Error, Result};
use crate::fingerprint::FingerprintAlgorithm;
use crate::types::Compression;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const MB: u64 = 1024 * 1024;

/// Metadata store backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaBackend {
    /// Embedded ordered key-value store (redb)
    #[default]
    Redb,
    /// Embedded relational store (SQLite, single key/value table)
    Sqlite,
}

/// How a compacted node replaces the original
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefragMode {
    /// Rename the compacted file over the original; the node id is kept
    #[default]
    Cover,
    /// Give the compacted file a new node id and delete the original
    Relocate,
}

/// What compaction does when it meets an unparsable record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TailPolicy {
    /// Leave the node untouched and fail the compaction
    #[default]
    Abort,
    /// Keep the records salvaged so far; the rest of the node is lost
    Truncate,
}

/// Storage engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory (`meta/` and `nodes/` live below it)
    pub data_dir: PathBuf,
    /// Fixed size of every node file
    pub node_capacity: u64,
    /// Largest accepted payload
    pub max_object_size: u64,
    /// Fingerprint algorithm; fixed for the lifetime of a data set
    pub fingerprint: FingerprintAlgorithm,
    /// Compression tag used when the caller does not pick one
    pub default_compression: i32,
    /// Maintain path beans and sequence numbers for listing and export
    pub listing: bool,
    /// fsync node appends and commit metadata with immediate durability
    pub sync_writes: bool,
    /// Metadata store backend
    pub meta_backend: MetaBackend,
    /// Capacity of each metadata record cache
    pub meta_cache_entries: usize,
    /// Bound of the reference-count coalescing map
    pub refcount_cache_entries: usize,
    /// Number of stripes in each lock pool
    pub lock_stripes: usize,
    /// Node utilization at which the next node is created in the background
    pub prealloc_ratio: f64,
    /// OS memory usage (percent) above which reads are delayed
    pub memory_limit_percent: Option<u8>,
    /// Memory sampling period
    pub memory_sample_interval_ms: u64,
    /// Compaction replacement mode
    pub defrag_mode: DefragMode,
    /// Consecutive empty records after which a compaction scan stops
    pub defrag_empty_record_limit: u32,
    /// Behavior on an unparsable record during compaction
    pub defrag_tail_policy: TailPolicy,
    /// Maximum number of paths in one export or import batch
    pub max_batch_paths: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./blobnode-data"),
            node_capacity: 500 * MB,
            max_object_size: 100 * MB,
            fingerprint: FingerprintAlgorithm::default(),
            default_compression: Compression::Lz4.tag(),
            listing: true,
            sync_writes: false,
            meta_backend: MetaBackend::default(),
            meta_cache_entries: 1 << 16,
            refcount_cache_entries: 1 << 15,
            lock_stripes: 512,
            prealloc_ratio: 0.9,
            memory_limit_percent: None,
            memory_sample_interval_ms: 10_000,
            defrag_mode: DefragMode::default(),
            defrag_empty_record_limit: 4,
            defrag_tail_policy: TailPolicy::default(),
            max_batch_paths: 10_000,
        }
    }
}

impl EngineConfig {
    /// Config rooted at `data_dir`, everything else default
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Directory holding the metadata store
    #[must_use]
    pub fn meta_dir(&self) -> PathBuf {
        self.data_dir.join("meta")
    }

    /// Directory holding node files
    #[must_use]
    pub fn nodes_dir(&self) -> PathBuf {
        self.data_dir.join("nodes")
    }

    /// Largest payload actually accepted (never more than one node can hold)
    #[must_use]
    pub fn effective_max_object_size(&self) -> u64 {
        self.max_object_size.min(self.node_capacity)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let record_overhead = self.fingerprint.len() as u64 + 4;
        if self.node_capacity <= record_overhead {
            return Err(Error::Configuration(format!(
                "node_capacity {} is too small",
                self.node_capacity
            )));
        }
        if usize::try_from(self.node_capacity).is_err() {
            return Err(Error::Configuration(format!(
                "node_capacity {} cannot be memory-mapped on this platform",
                self.node_capacity
            )));
        }
        if self.max_object_size == 0 || self.max_object_size > u64::from(u32::MAX) {
            return Err(Error::Configuration(format!(
                "max_object_size {} must be within 1..=u32::MAX",
                self.max_object_size
            )));
        }
        if Compression::from_tag(self.default_compression).is_none() {
            return Err(Error::Configuration(format!(
                "unknown default_compression tag {}",
                self.default_compression
            )));
        }
        if self.lock_stripes == 0
            || self.meta_cache_entries == 0
            || self.refcount_cache_entries == 0
        {
            return Err(Error::Configuration(
                "lock_stripes and cache sizes must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.prealloc_ratio) {
            return Err(Error::Configuration(format!(
                "prealloc_ratio {} must be within 0.0..=1.0",
                self.prealloc_ratio
            )));
        }
        if matches!(self.memory_limit_percent, Some(p) if p == 0 || p > 100) {
            return Err(Error::Configuration(
                "memory_limit_percent must be within 1..=100".into(),
            ));
        }
        Ok(())
    }
}
