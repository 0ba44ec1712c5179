//! Core type definitions for blobnode

use derive_more::{From, Into};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a node file
///
/// The low byte is a checksum of the upper seven bytes, so a file name can
/// be recognized as a node without consulting the metadata store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new random node id with an embedded checksum
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = rand::thread_rng().r#gen::<u64>().to_be_bytes();
        bytes[7] = Self::checksum(&bytes[..7]);
        Self(u64::from_be_bytes(bytes))
    }

    /// Whether the embedded checksum matches
    #[must_use]
    pub fn is_valid(self) -> bool {
        let bytes = self.0.to_be_bytes();
        bytes[7] == Self::checksum(&bytes[..7])
    }

    /// Raw value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Big-endian bytes, used in metadata keys
    #[must_use]
    pub const fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Printable form used as the node's file name
    #[must_use]
    pub fn encode(self) -> String {
        hex::encode(self.0.to_be_bytes())
    }

    /// Parse a file name produced by [`NodeId::encode`], rejecting bad checksums
    #[must_use]
    pub fn decode(name: &str) -> Option<Self> {
        if name.len() != 16 {
            return None;
        }
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(name, &mut bytes).ok()?;
        let id = Self(u64::from_be_bytes(bytes));
        id.is_valid().then_some(id)
    }

    fn checksum(bytes: &[u8]) -> u8 {
        (crc32c::crc32c(bytes) & 0xff) as u8
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.encode())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Compression codec applied to a stored payload
///
/// The integer tag is persisted in the blob's metadata, so different blobs in
/// one store may use different codecs:
/// `0` none, `1` LZ4, `2` Zstandard, `3..=11` zlib at level `tag - 2`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Zstd,
    Zlib(u8),
}

impl Compression {
    /// Resolve a persisted tag
    #[must_use]
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            2 => Some(Self::Zstd),
            3..=11 => u8::try_from(tag - 2).ok().map(Self::Zlib),
            _ => None,
        }
    }

    /// Persisted tag
    #[must_use]
    pub fn tag(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
            Self::Zstd => 2,
            Self::Zlib(level) => i32::from(level.clamp(1, 9)) + 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_checksum() {
        for _ in 0..100 {
            let id = NodeId::generate();
            assert!(id.is_valid());
            assert_eq!(NodeId::decode(&id.encode()), Some(id));
        }
    }

    #[test]
    fn test_node_id_rejects_tampered_names() {
        let id = NodeId::generate();
        let tampered = NodeId::from(id.as_u64() ^ 1);
        assert!(!tampered.is_valid());
        assert_eq!(NodeId::decode(&tampered.encode()), None);
        assert_eq!(NodeId::decode("not-a-node"), None);
        assert_eq!(NodeId::decode(&format!("{}_1", id.encode())), None);
    }

    #[test]
    fn test_compression_tags() {
        for tag in 0..=11 {
            let codec = Compression::from_tag(tag).unwrap();
            assert_eq!(codec.tag(), tag);
        }
        assert_eq!(Compression::from_tag(5), Some(Compression::Zlib(3)));
        assert_eq!(Compression::from_tag(12), None);
        assert_eq!(Compression::from_tag(-1), None);
    }
}
