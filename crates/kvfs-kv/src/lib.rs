//! # kvfs-kv
//!
//! The narrow transactional key-value contract kvfs is built on, plus two
//! drivers:
//!
//! - [`MemoryKv`] - ordered in-memory map with optimistic concurrency
//! - [`SqliteKv`] - embedded SQLite file, one serialized writer at a time
//!
//! All engine state lives behind [`KvStore::transact`]: a closure receives a
//! `&mut dyn` [`Transaction`], issues `get`/`set`/`clear`/`clear_range`/range
//! reads, and either commits as a whole or is retried from scratch on a
//! conflict. Keys are raw bytes ordered lexicographically, so tuple keys
//! built from big-endian components support prefix scans.

mod error;
pub mod memory;
pub mod sqlite;
mod transaction;

pub use error::{KvError, KvResult};
pub use memory::MemoryKv;
pub use sqlite::SqliteKv;
pub use transaction::{
    DEFAULT_PAGE_SIZE, KvPair, KvStore, RangeScan, RetryPolicy, Transaction, TxError,
    key_successor, prefix_end,
};
