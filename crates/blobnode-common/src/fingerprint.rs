//! Content and path fingerprints
//!
//! A fingerprint is a fixed-width digest used as a metadata key. The width
//! depends on the algorithm and is also the prefix width of every record in
//! a node file, so the algorithm must not change for an existing data set.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;

/// Digest algorithm used for blob and path fingerprints
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintAlgorithm {
    /// xxHash64 (fast, 8 bytes)
    #[default]
    Xxh64,
    /// SHA-1 (20 bytes)
    Sha1,
    /// SHA-256 (32 bytes)
    Sha256,
}

impl FingerprintAlgorithm {
    /// Width of a fingerprint in bytes
    #[must_use]
    pub const fn len(self) -> usize {
        match self {
            Self::Xxh64 => 8,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Stable name, persisted in the metadata store
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Xxh64 => "xxh64",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Parse a persisted name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "xxh64" => Some(Self::Xxh64),
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Compute the fingerprint of `data`
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Fingerprint {
        match self {
            Self::Xxh64 => Fingerprint(xxhash_rust::xxh64::xxh64(data, 0).to_be_bytes().to_vec()),
            Self::Sha1 => Fingerprint(Sha1::digest(data).to_vec()),
            Self::Sha256 => Fingerprint(Sha256::digest(data).to_vec()),
        }
    }
}

/// Fixed-width digest of a path or a payload
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    /// Wrap raw digest bytes (e.g. read back from a node record)
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Raw digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Width in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the zero-width fingerprint
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercase hex rendering
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_widths() {
        for algo in [
            FingerprintAlgorithm::Xxh64,
            FingerprintAlgorithm::Sha1,
            FingerprintAlgorithm::Sha256,
        ] {
            assert_eq!(algo.digest(b"hello, world!").len(), algo.len());
        }
    }

    #[test]
    fn test_digest_is_deterministic() {
        let algo = FingerprintAlgorithm::default();
        assert_eq!(algo.digest(b"/a/b.jpg"), algo.digest(b"/a/b.jpg"));
        assert_ne!(algo.digest(b"/a/b.jpg"), algo.digest(b"/a/c.jpg"));
    }

    #[test]
    fn test_name_round_trip() {
        assert_eq!(
            FingerprintAlgorithm::from_name(FingerprintAlgorithm::Sha1.name()),
            Some(FingerprintAlgorithm::Sha1)
        );
        assert_eq!(FingerprintAlgorithm::from_name("md4"), None);
    }

    #[test]
    fn test_sha256_known_vector() {
        let fp = FingerprintAlgorithm::Sha256.digest(b"abc");
        assert_eq!(
            fp.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
