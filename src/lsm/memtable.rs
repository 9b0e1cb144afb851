//! Active + frozen skip lists, the way `LsmTree::memtable` is used in the
//! C++ (`put` writes the active table; once it's frozen and flushed, reads
//! still have to check every not-yet-flushed frozen table, newest first).

use std::collections::VecDeque;

use crate::column::ColumnDescriptor;
use crate::config::LsmConfig;
use crate::rid::Rid;

use super::skiplist::SkipList;

pub struct MemTable {
    cols: Vec<ColumnDescriptor>,
    active: SkipList,
    /// Front = most recently frozen.
    frozen: VecDeque<SkipList>,
}

impl MemTable {
    pub fn new(cols: Vec<ColumnDescriptor>, _config: LsmConfig) -> Self {
        let active = SkipList::new(cols.clone(), 1024, crate::config::BLOOM_FALSE_POSITIVE_RATE);
        MemTable {
            cols,
            active,
            frozen: VecDeque::new(),
        }
    }

    pub fn put(&mut self, key: &[u8], rid: Rid) {
        self.active.put(key, rid);
    }

    pub fn remove(&mut self, key: &[u8]) {
        self.active.remove(key);
    }

    /// `None` distinguishes "not present anywhere in memory" from "present
    /// and deleted" (`Some(Rid::invalid())`); the caller maps the latter to
    /// "not found" once it knows no on-disk level can still shadow it.
    pub fn get(&self, key: &[u8]) -> Option<Rid> {
        if let Some(rid) = self.active.get(key) {
            return Some(rid);
        }
        for table in &self.frozen {
            if let Some(rid) = table.get(key) {
                return Some(rid);
            }
        }
        None
    }

    /// Sum of the active table's size plus every not-yet-flushed frozen
    /// table's size — the quantity `put`/`remove` compare against the
    /// tol-mem-size threshold.
    pub fn total_size(&self) -> usize {
        self.active.approx_size() + self.frozen.iter().map(|t| t.approx_size()).sum::<usize>()
    }

    pub fn active_size(&self) -> usize {
        self.active.approx_size()
    }

    /// Moves the active table to the front of the frozen queue and starts a
    /// fresh one in its place.
    pub fn freeze_active(&mut self) {
        let fresh = SkipList::new(self.cols.clone(), 1024, crate::config::BLOOM_FALSE_POSITIVE_RATE);
        let old = std::mem::replace(&mut self.active, fresh);
        if !old.is_empty() {
            self.frozen.push_front(old);
        }
    }

    /// Pops the oldest frozen table (the one a flush should write out
    /// next), or `None` if nothing is frozen.
    pub fn pop_oldest_frozen(&mut self) -> Option<SkipList> {
        self.frozen.pop_back()
    }

    pub fn frozen_count(&self) -> usize {
        self.frozen.len()
    }

    /// All entries, active table first then frozen newest-to-oldest,
    /// tombstones included — callers merging this against on-disk levels
    /// rely on that ordering to let an earlier (more recent) entry win a
    /// stable sort over a later (staler) one with the same key.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Rid)> {
        let mut out: Vec<(Vec<u8>, Rid)> = self.active.iter().collect();
        for t in &self.frozen {
            out.extend(t.iter());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnDescriptor;

    fn cols() -> Vec<ColumnDescriptor> {
        vec![ColumnDescriptor::int()]
    }

    #[test]
    fn reads_fall_through_active_to_frozen() {
        let mut mt = MemTable::new(cols(), LsmConfig::default());
        mt.put(&1i32.to_be_bytes(), Rid::new(1, 0));
        mt.freeze_active();
        mt.put(&2i32.to_be_bytes(), Rid::new(2, 0));
        assert_eq!(mt.get(&1i32.to_be_bytes()), Some(Rid::new(1, 0)));
        assert_eq!(mt.get(&2i32.to_be_bytes()), Some(Rid::new(2, 0)));
    }

    #[test]
    fn active_value_shadows_frozen_value_for_same_key() {
        let mut mt = MemTable::new(cols(), LsmConfig::default());
        mt.put(&1i32.to_be_bytes(), Rid::new(1, 0));
        mt.freeze_active();
        mt.put(&1i32.to_be_bytes(), Rid::new(1, 99));
        assert_eq!(mt.get(&1i32.to_be_bytes()), Some(Rid::new(1, 99)));
    }

    #[test]
    fn freezing_an_empty_active_table_is_a_no_op() {
        let mut mt = MemTable::new(cols(), LsmConfig::default());
        mt.freeze_active();
        assert_eq!(mt.frozen_count(), 0);
    }

    #[test]
    fn pop_oldest_frozen_returns_in_flush_order() {
        let mut mt = MemTable::new(cols(), LsmConfig::default());
        mt.put(&1i32.to_be_bytes(), Rid::new(1, 0));
        mt.freeze_active();
        mt.put(&2i32.to_be_bytes(), Rid::new(2, 0));
        mt.freeze_active();
        let oldest = mt.pop_oldest_frozen().unwrap();
        assert_eq!(oldest.get(&1i32.to_be_bytes()), Some(Rid::new(1, 0)));
    }
}
