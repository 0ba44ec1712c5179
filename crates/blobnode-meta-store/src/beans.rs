//! Records persisted in the metadata store.
//!
//! All of them are serialized with bincode.

use crate::store::MetaStoreResult;
use blobnode_common::NodeId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Bincode encoding shared by every stored record
pub trait Bean: Serialize + DeserializeOwned {
    /// Serialize to bytes
    fn to_bytes(&self) -> MetaStoreResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes
    fn from_bytes(data: &[u8]) -> MetaStoreResult<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Where a unique payload lives and how many paths reference it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBean {
    /// Node holding the record
    pub storenode: NodeId,
    /// Byte offset of the record header inside the node
    pub offset: u64,
    /// Stored (possibly compressed) payload length
    pub size: u64,
    /// Compression tag
    pub compress: i32,
    /// Number of paths mapped to this blob
    pub refcount: i64,
}

impl FileBean {
    /// Bytes the record occupies in its node, header included
    #[must_use]
    pub const fn record_len(&self, fp_len: usize) -> u64 {
        self.size + fp_len as u64 + 4
    }
}

impl Bean for FileBean {}

/// Listing record of one live path
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathBean {
    pub path: String,
    /// Unix nanoseconds of the last write
    pub timestamp: i64,
}

impl Bean for PathBean {}

/// Per-node bookkeeping
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBean {
    /// Bytes occupied by records no path references any more
    pub reclaimable_size: u64,
}

impl Bean for NodeBean {}

/// A compacted node whose file swap was committed in metadata
///
/// Written in the same batch that relocates the node's records and removed
/// once the compacted file is in place, so startup can finish a swap a crash
/// interrupted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapBean {
    /// Node that was compacted
    pub source: NodeId,
    /// Node id the compacted file is installed under
    pub target: NodeId,
    /// File name of the compacted output inside the node directory
    pub temp_file: String,
}

impl Bean for SwapBean {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_bean_record_len() {
        let bean = FileBean {
            storenode: NodeId::generate(),
            offset: 0,
            size: 100,
            compress: 1,
            refcount: 1,
        };
        assert_eq!(bean.record_len(8), 112);
        let decoded = FileBean::from_bytes(&bean.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, bean);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(PathBean::from_bytes(&[0xff; 3]).is_err());
    }
}
