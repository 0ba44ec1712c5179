//! Metadata key layout
//!
//! Every key starts with a one-byte type tag so each record family occupies
//! its own contiguous range:
//!
//! | key                          | value                          |
//! |------------------------------|--------------------------------|
//! | `b` + blob fingerprint       | [`FileBean`](crate::FileBean)  |
//! | `p` + path fingerprint       | blob fingerprint               |
//! | `i` + path bytes             | sequence number (u64 BE)       |
//! | `q` + sequence (u64 BE)      | [`PathBean`](crate::PathBean)  |
//! | `n` + node id (u64 BE)       | [`NodeBean`](crate::NodeBean)  |
//! | `e` + node id (u64 BE)       | committed end offset (u64 BE)  |
//! | `\0swap` + node id (u64 BE)  | [`SwapBean`](crate::SwapBean)  |
//! | `\0` + name                  | engine-wide counters           |

use blobnode_common::{Fingerprint, NodeId};
use std::cmp::Ordering;

pub const TAG_BLOB: u8 = b'b';
pub const TAG_PATH: u8 = b'p';
pub const TAG_PATH_NAME: u8 = b'i';
pub const TAG_PATH_SEQ: u8 = b'q';
pub const TAG_NODE: u8 = b'n';
pub const TAG_NODE_END: u8 = b'e';
pub const TAG_RESERVED: u8 = 0;

/// Currently active node id
pub const ACTIVE_NODE: &[u8] = b"\0active";
/// Last allocated sequence number
pub const SEQUENCE: &[u8] = b"\0seq";
/// Number of live paths
pub const LIVE_COUNT: &[u8] = b"\0count";
/// Fingerprint algorithm the data set was created with
pub const FINGERPRINT_ALGO: &[u8] = b"\0fingerprint";
/// Prefix of compaction swaps committed in metadata but not yet on disk
pub const PENDING_SWAP: &[u8] = b"\0swap";

/// Family a raw key belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Blob,
    Path,
    PathName,
    PathSeq,
    Node,
    NodeEnd,
    Reserved,
    Unknown,
}

/// Metadata key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetaKey(pub Vec<u8>);

impl MetaKey {
    fn tagged(tag: u8, body: &[u8]) -> Self {
        let mut key = Vec::with_capacity(1 + body.len());
        key.push(tag);
        key.extend_from_slice(body);
        Self(key)
    }

    /// Blob metadata key
    pub fn blob(fp: &Fingerprint) -> Self {
        Self::tagged(TAG_BLOB, fp.as_bytes())
    }

    /// Path index key (path fingerprint -> blob fingerprint)
    pub fn path(fp: &Fingerprint) -> Self {
        Self::tagged(TAG_PATH, fp.as_bytes())
    }

    /// Path name key (path -> sequence), ordered by path for prefix listing
    pub fn path_name(path: &str) -> Self {
        Self::tagged(TAG_PATH_NAME, path.as_bytes())
    }

    /// Path bean key
    pub fn path_seq(seq: u64) -> Self {
        Self::tagged(TAG_PATH_SEQ, &seq.to_be_bytes()) // Big-endian for sorting
    }

    /// Node bookkeeping key
    pub fn node(id: NodeId) -> Self {
        Self::tagged(TAG_NODE, &id.to_be_bytes())
    }

    /// Node committed-end key
    pub fn node_end(id: NodeId) -> Self {
        Self::tagged(TAG_NODE_END, &id.to_be_bytes())
    }

    /// Pending compaction swap marker for a source node
    pub fn pending_swap(id: NodeId) -> Self {
        let mut key = Vec::with_capacity(PENDING_SWAP.len() + 8);
        key.extend_from_slice(PENDING_SWAP);
        key.extend_from_slice(&id.to_be_bytes());
        Self(key)
    }

    /// Classify a raw key by its tag
    #[must_use]
    pub fn classify(key: &[u8]) -> KeyKind {
        match key.first() {
            Some(&TAG_BLOB) => KeyKind::Blob,
            Some(&TAG_PATH) => KeyKind::Path,
            Some(&TAG_PATH_NAME) => KeyKind::PathName,
            Some(&TAG_PATH_SEQ) if key.len() == 9 => KeyKind::PathSeq,
            Some(&TAG_NODE) if key.len() == 9 => KeyKind::Node,
            Some(&TAG_NODE_END) if key.len() == 9 => KeyKind::NodeEnd,
            Some(&TAG_RESERVED) => KeyKind::Reserved,
            _ => KeyKind::Unknown,
        }
    }

    /// Sequence number of a `q` key
    #[must_use]
    pub fn parse_seq(key: &[u8]) -> Option<u64> {
        match key {
            [TAG_PATH_SEQ, rest @ ..] => decode_u64(rest),
            _ => None,
        }
    }

    /// Node id of an `n` or `e` key
    #[must_use]
    pub fn parse_node(key: &[u8]) -> Option<NodeId> {
        match key {
            [TAG_NODE | TAG_NODE_END, rest @ ..] => decode_u64(rest).map(NodeId::from),
            _ => None,
        }
    }

    /// Path of an `i` key
    #[must_use]
    pub fn parse_path_name(key: &[u8]) -> Option<&str> {
        match key {
            [TAG_PATH_NAME, rest @ ..] => std::str::from_utf8(rest).ok(),
            _ => None,
        }
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl Ord for MetaKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for MetaKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl AsRef<[u8]> for MetaKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<MetaKey> for Vec<u8> {
    fn from(key: MetaKey) -> Self {
        key.0
    }
}

/// Encode a counter or offset value
#[must_use]
pub const fn encode_u64(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Decode a value written by [`encode_u64`]
#[must_use]
pub fn decode_u64(bytes: &[u8]) -> Option<u64> {
    <[u8; 8]>::try_from(bytes).ok().map(u64::from_be_bytes)
}

/// Smallest byte string greater than every key starting with `prefix`
///
/// `None` when no such bound exists (empty prefix or all `0xff` bytes).
#[must_use]
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}
