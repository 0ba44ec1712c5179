//! blobnode metadata store
//!
//! An ordered key-value abstraction with two interchangeable backends:
//! - **redb**: embedded copy-on-write B-tree store
//! - **SQLite**: embedded relational store holding one key/value table
//!
//! Both expose point reads, all-or-nothing batches, ordered prefix scans
//! and a consistent snapshot scan that runs while writes continue.

pub mod beans;
pub mod keys;
pub mod redb_store;
pub mod sqlite_store;
pub mod store;
mod tables;

pub use beans::{Bean, FileBean, NodeBean, PathBean, SwapBean};
pub use keys::{KeyKind, MetaKey};
pub use redb_store::RedbStore;
pub use sqlite_store::SqliteStore;
pub use store::{
    BatchOp, Durability, MetaStore, MetaStoreError, MetaStoreResult, WriteBatch, open_store,
};
