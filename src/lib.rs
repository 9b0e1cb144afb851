//! Indexed storage core: a disk-backed buffer pool, a latch-crabbing B+tree
//! index and an LSM-tree index over SSTables.
//!
//! This crate does not parse SQL, manage a catalog, or run a transaction
//! manager; it consumes a [`transaction::Transaction`] purely as a bag of
//! latches and undo records, and consumes [`rid::Rid`] as an opaque record
//! pointer owned by a heap file elsewhere in the system.

pub mod btree;
pub mod buffer;
pub mod column;
pub mod config;
pub mod disk;
pub mod error;
pub mod lsm;
pub mod page_id;
pub mod rid;
pub mod transaction;
pub mod types;

pub use column::{compare_key, ColumnDescriptor, ColumnType};
pub use error::StorageError;
pub use page_id::PageId;
pub use rid::Rid;
pub use transaction::Transaction;

/// Initializes the `env_logger` backend for `log`. Idempotent: safe to call
/// from multiple tests in the same process.
pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}
