//! Export and import record types

use serde::{Deserialize, Serialize};

/// One raw metadata key/value pair
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Metadata entries describing one path
///
/// Carries the path's index entry, its blob record, its listing record (when
/// listing is enabled) and, the first time a node is referenced within one
/// export, that node's bookkeeping entries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotGroup {
    /// Sequence number of the path, 0 when unknown
    pub id: u64,
    pub entries: Vec<SnapshotEntry>,
}

/// A path with its decompressed content
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub id: u64,
    pub path: String,
    pub data: Vec<u8>,
    /// Compression tag the blob was stored with
    pub compress: i32,
}

/// Result of importing one record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportOutcome {
    Applied,
    Skipped,
}
