//! Error types for blobnode
//!
//! Callers only ever see the closed set of [`ErrorKind`]s; the richer
//! [`Error`] variants carry context for logging and collapse to
//! [`ErrorKind::Undefined`] when they are not one of the caller-facing kinds.

use crate::types::NodeId;
use thiserror::Error;

/// Common result type for blobnode operations
pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of error kinds exposed to front-ends
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    OversizeObject,
    OversizeBatch,
    InvalidParameters,
    ConflictingDestination,
    NodeAppendFailed,
    NodeCreateFailed,
    DefragForbidden,
    ServiceStopped,
    Undefined,
}

impl ErrorKind {
    /// Stable numeric code (4xxx: caller errors, 5xxx: engine errors)
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::OversizeObject => 4101,
            Self::InvalidParameters => 4103,
            Self::AlreadyExists => 4104,
            Self::NotFound => 4106,
            Self::ConflictingDestination => 4107,
            Self::OversizeBatch => 4108,
            Self::Undefined => 5101,
            Self::DefragForbidden => 5102,
            Self::ServiceStopped => 5104,
            Self::NodeAppendFailed => 5105,
            Self::NodeCreateFailed => 5106,
        }
    }
}

/// Common error type for blobnode
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("object too large: {size} bytes exceeds limit of {max} bytes")]
    OversizeObject { size: u64, max: u64 },

    #[error("batch too large: {count} entries exceeds limit of {max}")]
    OversizeBatch { count: usize, max: usize },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("destination path already exists: {0}")]
    ConflictingDestination(String),

    #[error("append to node {node} failed: {reason}")]
    NodeAppendFailed { node: NodeId, reason: String },

    #[error("node creation failed: {0}")]
    NodeCreateFailed(String),

    #[error("node {0} is the active node and cannot be defragmented")]
    DefragForbidden(NodeId),

    #[error("service has stopped")]
    ServiceStopped,

    #[error("undefined error: {0}")]
    Undefined(String),

    // Internal errors, reported to callers as `Undefined`
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata store error: {0}")]
    Metadata(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an undefined error
    pub fn undefined(msg: impl Into<String>) -> Self {
        Self::Undefined(msg.into())
    }

    /// Create an invalid parameters error
    pub fn invalid_parameters(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a metadata error
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    /// Caller-facing kind of this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::OversizeObject { .. } => ErrorKind::OversizeObject,
            Self::OversizeBatch { .. } => ErrorKind::OversizeBatch,
            Self::InvalidParameters(_) => ErrorKind::InvalidParameters,
            Self::ConflictingDestination(_) => ErrorKind::ConflictingDestination,
            Self::NodeAppendFailed { .. } => ErrorKind::NodeAppendFailed,
            Self::NodeCreateFailed(_) => ErrorKind::NodeCreateFailed,
            Self::DefragForbidden(_) => ErrorKind::DefragForbidden,
            Self::ServiceStopped => ErrorKind::ServiceStopped,
            Self::Undefined(_)
            | Self::Io(_)
            | Self::Metadata(_)
            | Self::Corruption(_)
            | Self::Configuration(_) => ErrorKind::Undefined,
        }
    }

    /// Stable numeric code of this error's kind
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.kind().code()
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether a physical append failure should be retried against a fresh node
    #[must_use]
    pub const fn is_node_append_failure(&self) -> bool {
        matches!(self, Self::NodeAppendFailed { .. })
    }
}
