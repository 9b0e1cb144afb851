//! LSM-tree index: an in-memory skip-list memtable backed by an append-only
//! sequence of on-disk SSTables, compacted level by level. Kept alongside
//! `btree` as the other indexing strategy this crate exposes; the two share
//! nothing but [`crate::column::ColumnDescriptor`] and [`crate::rid::Rid`].

pub mod block;
pub mod bloom;
pub mod iterator;
pub mod memtable;
pub mod skiplist;
pub mod sstable;
pub mod tree;

pub use tree::LsmTree;
