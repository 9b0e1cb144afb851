//! Arena-indexed skip list: the active write buffer of an [`super::memtable::MemTable`].
//! The C++ `SkipList` links nodes through `shared_ptr`s; this port keeps
//! every node in one `Vec` and links levels by index instead, so there's no
//! reference-counted graph to walk on drop.
//!
//! Per the C++ class comment, keys are unique within one skip list and
//! every node currently reachable is visible to the caller — there is no
//! MVCC/timestamp layer here, `remove` is a tombstone `put`.

use std::convert::TryInto;

use rand::Rng;

use crate::column::{compare_key, ColumnDescriptor};
use crate::config::SKIPLIST_MAX_HEIGHT;
use crate::rid::Rid;

use super::bloom::BloomFilter;

const NIL: usize = usize::MAX;

struct Node {
    key: Vec<u8>,
    rid: Rid,
    next: Vec<usize>,
}

/// Owns its own bloom filter (per the C++ design, each skip list is queried
/// independently before a linear/level walk).
pub struct SkipList {
    cols: Vec<ColumnDescriptor>,
    nodes: Vec<Node>,
    head: Vec<usize>,
    height: usize,
    bloom: BloomFilter,
    approx_size: usize,
}

impl SkipList {
    pub fn new(cols: Vec<ColumnDescriptor>, expected_keys: usize, bloom_fp_rate: f64) -> Self {
        SkipList {
            cols,
            nodes: Vec::new(),
            head: vec![NIL; SKIPLIST_MAX_HEIGHT],
            height: 1,
            bloom: BloomFilter::new(expected_keys.max(1), bloom_fp_rate),
            approx_size: 0,
        }
    }

    fn random_height(&self) -> usize {
        let mut h = 1;
        let mut rng = rand::thread_rng();
        while h < SKIPLIST_MAX_HEIGHT && rng.gen_bool(0.25) {
            h += 1;
        }
        h
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        compare_key(a, b, &self.cols)
    }

    /// Per level, from the top down, the last node index whose key is `<
    /// key` (`NIL` if none is before the head).
    fn find_predecessors(&self, key: &[u8]) -> [usize; SKIPLIST_MAX_HEIGHT] {
        let mut prev = [NIL; SKIPLIST_MAX_HEIGHT];
        let mut cur = NIL;
        for level in (0..self.height).rev() {
            let mut next = if cur == NIL { self.head[level] } else { self.nodes[cur].next[level] };
            loop {
                match next {
                    NIL => break,
                    n if self.compare(&self.nodes[n].key, key) == std::cmp::Ordering::Less => {
                        cur = n;
                        next = self.nodes[n].next[level];
                    }
                    _ => break,
                }
            }
            prev[level] = cur;
        }
        prev
    }

    fn next_of(&self, node: usize, level: usize) -> usize {
        if node == NIL {
            self.head[level]
        } else {
            self.nodes[node].next[level]
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Rid> {
        if !self.bloom.may_contain(key) {
            return None;
        }
        let prev = self.find_predecessors(key);
        let candidate = self.next_of(prev[0], 0);
        if candidate != NIL && self.compare(&self.nodes[candidate].key, key) == std::cmp::Ordering::Equal {
            Some(self.nodes[candidate].rid)
        } else {
            None
        }
    }

    /// Overwrites in place if `key` already exists (matches the C++ `put`'s
    /// last-write-wins within a single table); otherwise inserts a new
    /// node at a coin-flipped height.
    pub fn put(&mut self, key: &[u8], rid: Rid) {
        self.bloom.add(key);
        let prev = self.find_predecessors(key);
        let candidate = self.next_of(prev[0], 0);
        if candidate != NIL && self.compare(&self.nodes[candidate].key, key) == std::cmp::Ordering::Equal {
            self.nodes[candidate].rid = rid;
            return;
        }

        let height = self.random_height();
        if height > self.height {
            self.height = height;
        }
        let idx = self.nodes.len();
        self.approx_size += key.len() + 8;
        self.nodes.push(Node {
            key: key.to_vec(),
            rid,
            next: vec![NIL; height],
        });
        for level in 0..height {
            let p = prev[level];
            let after = self.next_of(p, level);
            self.nodes[idx].next[level] = after;
            if p == NIL {
                self.head[level] = idx;
            } else {
                self.nodes[p].next[level] = idx;
            }
        }
    }

    pub fn remove(&mut self, key: &[u8]) {
        self.put(key, Rid::invalid());
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn approx_size(&self) -> usize {
        self.approx_size
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.bloom.may_contain(key)
    }

    /// In ascending key order, including tombstones — callers that care
    /// about tombstones (compaction) see them; callers that don't (a plain
    /// scan) filter on `rid.is_valid()` themselves.
    pub fn iter(&self) -> SkipListIter<'_> {
        SkipListIter { list: self, next: self.head[0] }
    }
}

pub struct SkipListIter<'a> {
    list: &'a SkipList,
    next: usize,
}

impl<'a> Iterator for SkipListIter<'a> {
    type Item = (Vec<u8>, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NIL {
            return None;
        }
        let node = &self.list.nodes[self.next];
        let item = (node.key.clone(), node.rid);
        self.next = node.next[0];
        Some(item)
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
    fn insert_get_in_any_order_reads_back() {
        let mut sl = SkipList::new(cols(), 256, 0.01);
        for i in (0..200i32).rev() {
            sl.put(&i.to_be_bytes(), Rid::new(i, 0));
        }
        for i in 0..200i32 {
            assert_eq!(sl.get(&i.to_be_bytes()), Some(Rid::new(i, 0)));
        }
        assert_eq!(sl.get(&999i32.to_be_bytes()), None);
    }

    #[test]
    fn put_overwrites_existing_key() {
        let mut sl = SkipList::new(cols(), 16, 0.01);
        sl.put(&1i32.to_be_bytes(), Rid::new(1, 0));
        sl.put(&1i32.to_be_bytes(), Rid::new(1, 9));
        assert_eq!(sl.get(&1i32.to_be_bytes()), Some(Rid::new(1, 9)));
        assert_eq!(sl.len(), 1);
    }

    #[test]
    fn remove_is_a_tombstone_not_a_physical_delete() {
        let mut sl = SkipList::new(cols(), 16, 0.01);
        sl.put(&1i32.to_be_bytes(), Rid::new(1, 0));
        sl.remove(&1i32.to_be_bytes());
        assert_eq!(sl.get(&1i32.to_be_bytes()), Some(Rid::invalid()));
        assert_eq!(sl.len(), 1);
    }

    #[test]
    fn iter_is_ascending() {
        let mut sl = SkipList::new(cols(), 64, 0.01);
        for i in [5, 1, 9, 3, 7] {
            sl.put(&(i as i32).to_be_bytes(), Rid::new(i, 0));
        }
        let keys: Vec<i32> = sl.iter().map(|(k, _)| i32::from_be_bytes(k.try_into().unwrap())).collect();
        assert_eq!(keys, vec![1, 3, 5, 7, 9]);
    }
}
