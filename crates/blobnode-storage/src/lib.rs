//! blobnode storage engine
//!
//! This crate implements the blob storage engine:
//! - Append-only, memory-mapped node files with background pre-allocation
//! - Content addressing with reference-counted deduplication
//! - Payload compression (LZ4, Zstandard, zlib)
//! - Striped locks and ARC metadata caches
//! - Node compaction with crash-safe swaps
//! - Metadata and file-data export/import

pub mod blob_store;
pub mod cache;
pub mod compress;
mod defrag;
pub mod engine;
mod export;
pub mod lock;
pub mod memory;
pub mod node;
pub mod nodes;
pub mod snapshot;

// Re-exports
pub use blob_store::BlobStore;
pub use cache::{ArcCache, CacheStats, RefCounts};
pub use compress::{codec_for_tag, compress, decompress};
pub use engine::{BlobEngine, EngineStats, FragReport, PathEntry};
pub use lock::StripedLock;
pub use memory::MemoryMonitor;
pub use node::{NodeFile, ScanStep};
pub use nodes::NodeManager;
pub use snapshot::{FileSnapshot, ImportOutcome, SnapshotEntry, SnapshotGroup};
