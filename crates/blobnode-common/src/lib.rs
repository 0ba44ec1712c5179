//! blobnode common - shared types and utilities
//!
//! This crate provides the error type, fingerprint algorithms, node
//! identifiers, compression tags and engine configuration used by the
//! metadata store and the storage engine.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod types;

pub use config::{DefragMode, EngineConfig, MetaBackend, TailPolicy};
pub use error::{Error, ErrorKind, Result};
pub use fingerprint::{Fingerprint, FingerprintAlgorithm};
pub use types::{Compression, NodeId};
