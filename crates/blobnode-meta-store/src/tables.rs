//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Every metadata record lives in one ordered table; the first key byte is its type tag
pub const KV: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv");
