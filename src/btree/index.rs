use std::path::Path;
use std::sync::{Arc, RwLock};

use log::debug;

use crate::buffer::BufferPool;
use crate::column::{compare_key, ColumnDescriptor};
use crate::config::PAGE_SIZE;
use crate::disk::DiskManager;
use crate::error::{StorageError, StorageResult};
use crate::page_id::PageId;
use crate::rid::Rid;
use crate::transaction::{Transaction, WriteUndo};
use crate::types::HandyRwLock;

use super::file_header::IndexFileHeader;
use super::node::NodeHandle;

/// A disk-backed B+tree index over one or more fixed-width columns.
///
/// Concurrency model: each node's latch is the `RwLock` inside its pinned
/// buffer-pool frame. A single descent (insert or delete) holds every
/// ancestor's latch for the full depth of its own recursive call rather
/// than releasing them early the moment a node proves safe — see
/// `DESIGN.md` for why the is_safe-triggered early-release optimization
/// was cut in favor of this simpler, still-correct lock-coupling scheme.
/// Reads do not crab at all: `get_value`/`scan` latch one node at a time
/// and release it before moving to the next.
pub struct BPlusTreeIndex {
    fd: i32,
    buffer_pool: Arc<BufferPool>,
    disk: Arc<DiskManager>,
    /// Guards the root page number itself; holding it for the whole
    /// operation is what makes inserts/deletes mutually exclusive
    /// tree-wide in this simplified scheme.
    root_page_no: RwLock<i32>,
    cols: Vec<ColumnDescriptor>,
    key_len: usize,
}

/// The new separator key and sibling produced when a node splits, to be
/// absorbed by the caller's parent.
struct Split {
    key: Vec<u8>,
    left: PageId,
    right: PageId,
}

impl BPlusTreeIndex {
    pub fn create<P: AsRef<Path>>(
        path: P,
        cols: Vec<ColumnDescriptor>,
        disk: Arc<DiskManager>,
        buffer_pool: Arc<BufferPool>,
    ) -> StorageResult<Self> {
        let path = path.as_ref();
        disk.create_file(path)?;
        let fd = disk.open_file(path)?;

        let key_len = crate::column::key_length(&cols);
        let header = IndexFileHeader::new(cols.clone());

        let header_page_no = disk.allocate_page(fd)?;
        debug_assert_eq!(header_page_no, 0);
        disk.write_page(fd, 0, &header.serialize())?;

        let (root_pid, root_pod) = buffer_pool.new_page(fd)?;
        {
            let mut guard = root_pod.wl();
            let mut node = NodeHandle::new(&mut guard.data, &cols, key_len);
            node.init_leaf();
        }
        buffer_pool.unpin_page(root_pid, true)?;
        buffer_pool.flush_page(root_pid)?;

        debug!("created index {} with root at page {}", path.display(), root_pid.page_no);

        Ok(BPlusTreeIndex {
            fd,
            buffer_pool,
            disk,
            root_page_no: RwLock::new(root_pid.page_no),
            cols,
            key_len,
        })
    }

    pub fn open<P: AsRef<Path>>(
        path: P,
        disk: Arc<DiskManager>,
        buffer_pool: Arc<BufferPool>,
    ) -> StorageResult<Self> {
        let path = path.as_ref();
        let fd = disk.open_file(path)?;
        let mut buf = [0u8; PAGE_SIZE];
        disk.read_page(fd, 0, &mut buf)?;
        let header = IndexFileHeader::deserialize(&buf)?;
        Ok(BPlusTreeIndex {
            fd,
            buffer_pool,
            disk,
            root_page_no: RwLock::new(header.root_page_no),
            cols: header.cols.clone(),
            key_len: header.key_len(),
        })
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn cols(&self) -> &[ColumnDescriptor] {
        &self.cols
    }

    fn root_pid(&self) -> PageId {
        PageId::new(self.fd, *self.root_page_no.rl())
    }

    fn persist_root(&self, page_no: i32) -> StorageResult<()> {
        let mut buf = [0u8; PAGE_SIZE];
        self.disk.read_page(self.fd, 0, &mut buf)?;
        let mut header = IndexFileHeader::deserialize(&buf)?;
        header.root_page_no = page_no;
        self.disk.write_page(self.fd, 0, &header.serialize())
    }

    fn set_parent_of(&self, pid: PageId, parent: PageId) -> StorageResult<()> {
        let pod = self.buffer_pool.fetch_page(pid)?;
        {
            let mut guard = pod.wl();
            let mut node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
            node.set_parent(parent);
        }
        self.buffer_pool.unpin_page(pid, true)
    }

    /// Frees every index page a prior `delete_entry` queued via a coalesce,
    /// now that the caller is done with `tx` and those pages can no longer
    /// be reachable from a concurrent descent that started before the
    /// coalesce. Not itself transactional: this crate keeps no WAL, so a
    /// crash between a coalesce and `commit` just leaks the freed pages.
    pub fn commit(&self, tx: &Transaction) -> StorageResult<()> {
        for pid in tx.take_pages_to_delete() {
            self.buffer_pool.delete_page(pid)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------- get

    pub fn get_value(&self, key: &[u8]) -> StorageResult<Option<Rid>> {
        let mut pid = self.root_pid();
        loop {
            let pod = self.buffer_pool.fetch_page(pid)?;
            let result = {
                let mut guard = pod.wl();
                let node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
                if node.is_leaf() {
                    let idx = node.lower_bound(key);
                    if idx < node.num_key() && compare_key(node.leaf_key(idx), key, &self.cols) == std::cmp::Ordering::Equal {
                        Ok(Some(node.leaf_rid(idx)))
                    } else {
                        Ok(None)
                    }
                } else {
                    Err(node.find_child_for_key(key))
                }
            };
            self.buffer_pool.unpin_page(pid, false)?;
            match result {
                Ok(v) => return Ok(v),
                Err(child_pid) => pid = child_pid,
            }
        }
    }

    // --------------------------------------------------------------- scan

    /// Returns an iterator over `(key, Rid)` pairs in ascending key order,
    /// starting at the first entry `>= lower` (or the very first entry, if
    /// `lower` is `None`). Walks the leaf level's `next_leaf` chain, the
    /// same cursor the original `Iid`-based range scan uses.
    pub fn scan(&self, lower: Option<&[u8]>) -> StorageResult<IndexScan> {
        let mut pid = self.root_pid();
        loop {
            let pod = self.buffer_pool.fetch_page(pid)?;
            let step = {
                let mut guard = pod.wl();
                let node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
                if node.is_leaf() {
                    let idx = match lower {
                        Some(k) => node.lower_bound(k),
                        None => 0,
                    };
                    Ok(idx)
                } else {
                    let child = match lower {
                        Some(k) => node.find_child_for_key(k),
                        None => node.child(0),
                    };
                    Err(child)
                }
            };
            self.buffer_pool.unpin_page(pid, false)?;
            match step {
                Ok(idx) => {
                    return Ok(IndexScan {
                        buffer_pool: self.buffer_pool.clone(),
                        cols: self.cols.clone(),
                        key_len: self.key_len,
                        current_leaf: Some(pid),
                        idx_in_leaf: idx,
                    })
                }
                Err(child_pid) => pid = child_pid,
            }
        }
    }

    // ------------------------------------------------------------- insert

    pub fn insert_entry(&self, tx: &Transaction, key: &[u8], rid: Rid) -> StorageResult<()> {
        if key.len() != self.key_len {
            return Err(StorageError::InvalidColLength {
                expected: self.key_len,
                got: key.len(),
            });
        }

        let mut root_guard = self.root_page_no.write().unwrap();
        let root_pid = PageId::new(self.fd, *root_guard);

        let (split, leaf_pid) = self.insert_recursive(tx, root_pid, key, rid)?;

        if let Some(Split { key: sep, left, right }) = split {
            let (new_root_pid, new_root_pod) = self.buffer_pool.new_page(self.fd)?;
            {
                let mut guard = new_root_pod.wl();
                let mut node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
                node.init_internal();
                node.set_single_separator(&sep, left, right);
            }
            self.buffer_pool.unpin_page(new_root_pid, true)?;
            self.set_parent_of(left, new_root_pid)?;
            self.set_parent_of(right, new_root_pid)?;

            *root_guard = new_root_pid.page_no;
            self.persist_root(new_root_pid.page_no)?;
        }

        tx.record_undo(WriteUndo::Insert { page: leaf_pid, rid });
        Ok(())
    }

    /// Descends to the leaf that should hold `key`, inserts it, and bubbles
    /// any resulting split back up through the call stack. Returns the
    /// split (if any) and the page the entry actually landed on, for the
    /// caller's undo record.
    fn insert_recursive(
        &self,
        tx: &Transaction,
        pid: PageId,
        key: &[u8],
        rid: Rid,
    ) -> StorageResult<(Option<Split>, PageId)> {
        let pod = self.buffer_pool.fetch_page(pid)?;
        tx.push_latch(pid);
        let mut guard = pod.wl();
        let is_leaf = {
            let node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
            node.is_leaf()
        };

        if is_leaf {
            let (dup, safe) = {
                let node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
                let idx = node.lower_bound(key);
                let dup = idx < node.num_key()
                    && compare_key(node.leaf_key(idx), key, &self.cols) == std::cmp::Ordering::Equal;
                (dup, node.is_safe_for_insert())
            };
            if dup {
                drop(guard);
                self.buffer_pool.unpin_page(pid, false)?;
                return Err(StorageError::IndexEntryAlreadyExists);
            }
            if safe {
                {
                    let mut node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
                    node.insert_leaf_entry(key, rid);
                }
                drop(guard);
                self.buffer_pool.unpin_page(pid, true)?;
                return Ok((None, pid));
            }

            // Leaf is full: split it, then insert into whichever half the
            // key belongs to.
            let split = self.split_leaf(pid, &mut guard)?;
            let goes_right = compare_key(key, &split.key, &self.cols) != std::cmp::Ordering::Less;
            let landed_pid;
            if goes_right {
                drop(guard);
                self.buffer_pool.unpin_page(pid, true)?;
                let right_pod = self.buffer_pool.fetch_page(split.right)?;
                {
                    let mut rg = right_pod.wl();
                    let mut rnode = NodeHandle::new(&mut rg.data, &self.cols, self.key_len);
                    rnode.insert_leaf_entry(key, rid);
                }
                self.buffer_pool.unpin_page(split.right, true)?;
                landed_pid = split.right;
            } else {
                {
                    let mut node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
                    node.insert_leaf_entry(key, rid);
                }
                drop(guard);
                self.buffer_pool.unpin_page(pid, true)?;
                landed_pid = pid;
            }
            return Ok((Some(split), landed_pid));
        }

        // Internal node: keep this guard held across the recursive call
        // (conservative lock coupling, see struct-level doc comment).
        let child_pid = {
            let node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
            node.find_child_for_key(key)
        };
        let (child_split, landed_pid) = self.insert_recursive(tx, child_pid, key, rid)?;

        match child_split {
            None => {
                drop(guard);
                self.buffer_pool.unpin_page(pid, false)?;
                Ok((None, landed_pid))
            }
            Some(Split { key: sep, left, right: new_right }) => {
                let (left_idx, is_full, mid) = {
                    let node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
                    let idx = node
                        .find_child_index(left)
                        .ok_or_else(|| StorageError::internal("split child missing from parent"))?;
                    (idx, node.num_key() >= node.capacity(), node.num_key() / 2)
                };

                if !is_full {
                    {
                        let mut node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
                        node.insert_internal_entry(left_idx, &sep, new_right);
                    }
                    drop(guard);
                    self.buffer_pool.unpin_page(pid, true)?;
                    return Ok((None, landed_pid));
                }

                // Parent is full: split it first, then insert the new
                // separator into whichever half it belongs to, mirroring
                // the leaf branch above. `left_idx` is also the key/child
                // index the separator must land at, so compare it against
                // `mid` (the split point computed before `split_internal`
                // shuffles anything) rather than the key bytes themselves.
                let split = self.split_internal(pid, &mut guard)?;
                if left_idx <= mid {
                    {
                        let mut node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
                        node.insert_internal_entry(left_idx, &sep, new_right);
                    }
                    drop(guard);
                    self.buffer_pool.unpin_page(pid, true)?;
                } else {
                    drop(guard);
                    self.buffer_pool.unpin_page(pid, true)?;
                    let right_pod = self.buffer_pool.fetch_page(split.right)?;
                    {
                        let mut rg = right_pod.wl();
                        let mut rnode = NodeHandle::new(&mut rg.data, &self.cols, self.key_len);
                        rnode.insert_internal_entry(left_idx - mid - 1, &sep, new_right);
                    }
                    self.buffer_pool.unpin_page(split.right, true)?;
                    self.set_parent_of(new_right, split.right)?;
                }
                Ok((Some(split), landed_pid))
            }
        }
    }

    fn split_leaf(&self, pid: PageId, guard: &mut crate::buffer::Frame) -> StorageResult<Split> {
        let (right_pid, right_pod) = self.buffer_pool.new_page(self.fd)?;
        let move_count;
        let sep_key;
        let old_next;
        {
            let node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
            move_count = node.num_key() / 2;
            old_next = node.next_leaf();
        }
        {
            let mut right_guard = right_pod.wl();
            let mut right_node = NodeHandle::new(&mut right_guard.data, &self.cols, self.key_len);
            right_node.init_leaf();
            let mut left_node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
            let total = left_node.num_key();
            for i in (total - move_count)..total {
                right_node.insert_leaf_entry(left_node.leaf_key(i), left_node.leaf_rid(i));
            }
            for _ in 0..move_count {
                left_node.remove_leaf_entry(left_node.num_key() - 1);
            }
            sep_key = right_node.first_key().to_vec();
            right_node.set_next_leaf(old_next);
            right_node.set_parent(left_node.parent());
        }
        {
            let mut left_node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
            left_node.set_next_leaf(right_pid);
        }
        self.buffer_pool.unpin_page(right_pid, true)?;
        Ok(Split {
            key: sep_key,
            left: pid,
            right: right_pid,
        })
    }

    fn split_internal(&self, pid: PageId, guard: &mut crate::buffer::Frame) -> StorageResult<Split> {
        let (right_pid, right_pod) = self.buffer_pool.new_page(self.fd)?;
        let mid;
        let mid_key;
        let parent;
        {
            let node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
            mid = node.num_key() / 2;
            mid_key = node.internal_key(mid).to_vec();
            parent = node.parent();
        }
        let moved_children;
        {
            let mut right_guard = right_pod.wl();
            let mut right_node = NodeHandle::new(&mut right_guard.data, &self.cols, self.key_len);
            right_node.init_internal();
            right_node.set_parent(parent);
            let left_node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
            let total = left_node.num_key();

            right_node.set_child(0, left_node.child(mid + 1));
            for i in (mid + 1)..total {
                right_node.insert_internal_entry(i - mid - 1, left_node.internal_key(i), left_node.child(i + 1));
            }
            moved_children = right_node.children();
        }
        {
            let mut left_node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
            left_node.set_num_key(mid);
        }
        self.buffer_pool.unpin_page(right_pid, true)?;
        for child in moved_children {
            self.set_parent_of(child, right_pid)?;
        }
        Ok(Split {
            key: mid_key,
            left: pid,
            right: right_pid,
        })
    }

    // ------------------------------------------------------------- delete

    pub fn delete_entry(&self, tx: &Transaction, key: &[u8]) -> StorageResult<()> {
        let mut root_guard = self.root_page_no.write().unwrap();
        let root_pid = PageId::new(self.fd, *root_guard);

        let root_underflow = self.delete_recursive(tx, root_pid, key)?;
        if root_underflow {
            if let Some(new_root_no) = self.adjust_root(root_pid)? {
                *root_guard = new_root_no;
                self.persist_root(new_root_no)?;
            }
        }
        Ok(())
    }

    /// Returns whether `pid` is now underflowed (below half capacity) and,
    /// if so, not yet fixed by its own recursive call — the caller (the
    /// node one level up, which still holds its own latch) is responsible
    /// for redistributing or coalescing it with a sibling. The root is
    /// exempt from this and handled separately by `adjust_root`.
    fn delete_recursive(&self, tx: &Transaction, pid: PageId, key: &[u8]) -> StorageResult<bool> {
        let pod = self.buffer_pool.fetch_page(pid)?;
        tx.push_latch(pid);
        let mut guard = pod.wl();
        let is_leaf = {
            let node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
            node.is_leaf()
        };

        if is_leaf {
            let found = {
                let node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
                let idx = node.lower_bound(key);
                if idx < node.num_key() && compare_key(node.leaf_key(idx), key, &self.cols) == std::cmp::Ordering::Equal {
                    Some((idx, node.leaf_rid(idx)))
                } else {
                    None
                }
            };
            let (idx, rid) = match found {
                Some(v) => v,
                None => {
                    drop(guard);
                    self.buffer_pool.unpin_page(pid, false)?;
                    return Err(StorageError::IndexEntryNotFound);
                }
            };
            tx.record_undo(WriteUndo::Delete {
                page: pid,
                rid,
                key: key.to_vec(),
            });
            let underflow = {
                let mut node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
                node.remove_leaf_entry(idx);
                node.is_underflow()
            };
            drop(guard);
            self.buffer_pool.unpin_page(pid, true)?;
            return Ok(underflow);
        }

        let child_pid = {
            let node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
            node.find_child_for_key(key)
        };
        let child_underflow = self.delete_recursive(tx, child_pid, key)?;
        if !child_underflow {
            drop(guard);
            self.buffer_pool.unpin_page(pid, false)?;
            return Ok(false);
        }

        self.fix_child_underflow(tx, &mut guard, child_pid)?;
        let self_underflow = {
            let node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
            node.is_underflow()
        };
        drop(guard);
        self.buffer_pool.unpin_page(pid, true)?;
        Ok(self_underflow)
    }

    /// Redistributes an entry from a sibling into `child_pid`, or merges
    /// the two if neither sibling has a spare. Prefers the left sibling,
    /// matching `IxIndexHandle::coalesce_or_redistribute`. `parent_guard`
    /// must belong to `child_pid`'s parent and is updated in place.
    fn fix_child_underflow(
        &self,
        tx: &Transaction,
        parent_guard: &mut crate::buffer::Frame,
        child_pid: PageId,
    ) -> StorageResult<()> {
        let (child_idx, left_sib, right_sib) = {
            let node = NodeHandle::new(&mut parent_guard.data, &self.cols, self.key_len);
            let idx = node
                .find_child_index(child_pid)
                .ok_or_else(|| StorageError::internal("underflowed child missing from parent"))?;
            let n = node.num_key();
            let left = if idx > 0 { Some(node.child(idx - 1)) } else { None };
            let right = if idx < n { Some(node.child(idx + 1)) } else { None };
            (idx, left, right)
        };

        if let Some(left_pid) = left_sib {
            return self.fix_with_left_sibling(tx, parent_guard, child_idx, left_pid, child_pid);
        }
        let right_pid = right_sib.ok_or_else(|| StorageError::internal("underflowed node has no siblings"))?;
        self.fix_with_right_sibling(tx, parent_guard, child_idx, child_pid, right_pid)
    }

    fn fix_with_left_sibling(
        &self,
        tx: &Transaction,
        parent_guard: &mut crate::buffer::Frame,
        child_idx: usize,
        left_pid: PageId,
        child_pid: PageId,
    ) -> StorageResult<()> {
        let left_pod = self.buffer_pool.fetch_page(left_pid)?;
        let child_pod = self.buffer_pool.fetch_page(child_pid)?;
        let mut left_guard = left_pod.wl();
        let mut child_guard = child_pod.wl();
        let left_can_lend = {
            let node = NodeHandle::new(&mut left_guard.data, &self.cols, self.key_len);
            node.num_key() > node.min_size()
        };
        let is_leaf = {
            let node = NodeHandle::new(&mut child_guard.data, &self.cols, self.key_len);
            node.is_leaf()
        };

        if left_can_lend {
            if is_leaf {
                let (k, r) = {
                    let mut ln = NodeHandle::new(&mut left_guard.data, &self.cols, self.key_len);
                    ln.pop_last_leaf()
                };
                {
                    let mut cn = NodeHandle::new(&mut child_guard.data, &self.cols, self.key_len);
                    cn.insert_leaf_entry(&k, r);
                }
                let mut pn = NodeHandle::new(&mut parent_guard.data, &self.cols, self.key_len);
                pn.set_internal_key_at(child_idx - 1, &k);
            } else {
                let (moved_key, moved_child) = {
                    let mut ln = NodeHandle::new(&mut left_guard.data, &self.cols, self.key_len);
                    ln.pop_last_internal()
                };
                let sep = {
                    let pn = NodeHandle::new(&mut parent_guard.data, &self.cols, self.key_len);
                    pn.internal_key(child_idx - 1).to_vec()
                };
                {
                    let mut cn = NodeHandle::new(&mut child_guard.data, &self.cols, self.key_len);
                    cn.prepend_internal(moved_child, &sep);
                }
                {
                    let mut pn = NodeHandle::new(&mut parent_guard.data, &self.cols, self.key_len);
                    pn.set_internal_key_at(child_idx - 1, &moved_key);
                }
                drop(left_guard);
                drop(child_guard);
                self.set_parent_of(moved_child, child_pid)?;
                self.buffer_pool.unpin_page(left_pid, true)?;
                self.buffer_pool.unpin_page(child_pid, true)?;
                return Ok(());
            }
            drop(left_guard);
            drop(child_guard);
            self.buffer_pool.unpin_page(left_pid, true)?;
            self.buffer_pool.unpin_page(child_pid, true)?;
            return Ok(());
        }

        // Merge child into left sibling.
        let moved_children = if is_leaf {
            let child_next = {
                let child_node = NodeHandle::new(&mut child_guard.data, &self.cols, self.key_len);
                let mut left_node = NodeHandle::new(&mut left_guard.data, &self.cols, self.key_len);
                left_node.append_leaf_all_from(&child_node);
                child_node.next_leaf()
            };
            let mut left_node = NodeHandle::new(&mut left_guard.data, &self.cols, self.key_len);
            left_node.set_next_leaf(child_next);
            Vec::new()
        } else {
            let sep = {
                let pn = NodeHandle::new(&mut parent_guard.data, &self.cols, self.key_len);
                pn.internal_key(child_idx - 1).to_vec()
            };
            let child_node = NodeHandle::new(&mut child_guard.data, &self.cols, self.key_len);
            let mut left_node = NodeHandle::new(&mut left_guard.data, &self.cols, self.key_len);
            left_node.append_internal_all_from(&sep, &child_node);
            child_node.children()
        };
        drop(left_guard);
        drop(child_guard);
        for c in moved_children {
            self.set_parent_of(c, left_pid)?;
        }
        self.buffer_pool.unpin_page(left_pid, true)?;
        self.buffer_pool.unpin_page(child_pid, false)?;
        tx.queue_page_for_deletion(child_pid);
        let mut pn = NodeHandle::new(&mut parent_guard.data, &self.cols, self.key_len);
        pn.remove_internal_entry(child_idx - 1);
        Ok(())
    }

    fn fix_with_right_sibling(
        &self,
        tx: &Transaction,
        parent_guard: &mut crate::buffer::Frame,
        child_idx: usize,
        child_pid: PageId,
        right_pid: PageId,
    ) -> StorageResult<()> {
        let right_pod = self.buffer_pool.fetch_page(right_pid)?;
        let child_pod = self.buffer_pool.fetch_page(child_pid)?;
        let mut right_guard = right_pod.wl();
        let mut child_guard = child_pod.wl();
        let right_can_lend = {
            let node = NodeHandle::new(&mut right_guard.data, &self.cols, self.key_len);
            node.num_key() > node.min_size()
        };
        let is_leaf = {
            let node = NodeHandle::new(&mut child_guard.data, &self.cols, self.key_len);
            node.is_leaf()
        };

        if right_can_lend {
            if is_leaf {
                let (k, r) = {
                    let mut rn = NodeHandle::new(&mut right_guard.data, &self.cols, self.key_len);
                    rn.pop_first_leaf()
                };
                {
                    let mut cn = NodeHandle::new(&mut child_guard.data, &self.cols, self.key_len);
                    cn.insert_leaf_entry(&k, r);
                }
                let new_sep = {
                    let rn = NodeHandle::new(&mut right_guard.data, &self.cols, self.key_len);
                    rn.first_key().to_vec()
                };
                let mut pn = NodeHandle::new(&mut parent_guard.data, &self.cols, self.key_len);
                pn.set_internal_key_at(child_idx, &new_sep);
                drop(right_guard);
                drop(child_guard);
                self.buffer_pool.unpin_page(right_pid, true)?;
                self.buffer_pool.unpin_page(child_pid, true)?;
                return Ok(());
            }
            let (moved_child, moved_key) = {
                let mut rn = NodeHandle::new(&mut right_guard.data, &self.cols, self.key_len);
                rn.pop_first_internal()
            };
            let sep = {
                let pn = NodeHandle::new(&mut parent_guard.data, &self.cols, self.key_len);
                pn.internal_key(child_idx).to_vec()
            };
            {
                let mut cn = NodeHandle::new(&mut child_guard.data, &self.cols, self.key_len);
                cn.append_internal(&sep, moved_child);
            }
            {
                let mut pn = NodeHandle::new(&mut parent_guard.data, &self.cols, self.key_len);
                pn.set_internal_key_at(child_idx, &moved_key);
            }
            drop(right_guard);
            drop(child_guard);
            self.set_parent_of(moved_child, child_pid)?;
            self.buffer_pool.unpin_page(right_pid, true)?;
            self.buffer_pool.unpin_page(child_pid, true)?;
            return Ok(());
        }

        // Merge right sibling into child.
        let moved_children = if is_leaf {
            let right_next = {
                let right_node = NodeHandle::new(&mut right_guard.data, &self.cols, self.key_len);
                let mut child_node = NodeHandle::new(&mut child_guard.data, &self.cols, self.key_len);
                child_node.append_leaf_all_from(&right_node);
                right_node.next_leaf()
            };
            let mut child_node = NodeHandle::new(&mut child_guard.data, &self.cols, self.key_len);
            child_node.set_next_leaf(right_next);
            Vec::new()
        } else {
            let sep = {
                let pn = NodeHandle::new(&mut parent_guard.data, &self.cols, self.key_len);
                pn.internal_key(child_idx).to_vec()
            };
            let right_node = NodeHandle::new(&mut right_guard.data, &self.cols, self.key_len);
            let mut child_node = NodeHandle::new(&mut child_guard.data, &self.cols, self.key_len);
            child_node.append_internal_all_from(&sep, &right_node);
            right_node.children()
        };
        drop(right_guard);
        drop(child_guard);
        for c in moved_children {
            self.set_parent_of(c, child_pid)?;
        }
        self.buffer_pool.unpin_page(child_pid, true)?;
        self.buffer_pool.unpin_page(right_pid, false)?;
        tx.queue_page_for_deletion(right_pid);
        let mut pn = NodeHandle::new(&mut parent_guard.data, &self.cols, self.key_len);
        pn.remove_internal_entry(child_idx);
        Ok(())
    }

    /// Collapses the root if it is an internal node left with a single
    /// child after a coalesce; a leaf root is always valid, even empty.
    fn adjust_root(&self, root_pid: PageId) -> StorageResult<Option<i32>> {
        let pod = self.buffer_pool.fetch_page(root_pid)?;
        let (is_leaf, collapse_to) = {
            let mut guard = pod.wl();
            let node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
            if node.is_leaf() {
                (true, None)
            } else if node.num_key() == 0 {
                (false, Some(node.child(0)))
            } else {
                (false, None)
            }
        };
        self.buffer_pool.unpin_page(root_pid, false)?;
        if is_leaf {
            return Ok(None);
        }
        match collapse_to {
            Some(new_root) => {
                let new_pod = self.buffer_pool.fetch_page(new_root)?;
                {
                    let mut ng = new_pod.wl();
                    let mut nn = NodeHandle::new(&mut ng.data, &self.cols, self.key_len);
                    nn.set_parent(PageId::invalid());
                }
                self.buffer_pool.unpin_page(new_root, true)?;
                self.buffer_pool.delete_page(root_pid)?;
                Ok(Some(new_root.page_no))
            }
            None => Ok(None),
        }
    }
}

/// Ascending `(key, Rid)` cursor produced by `BPlusTreeIndex::scan`. Walks
/// the leaf chain via `next_leaf`, latching one leaf at a time.
pub struct IndexScan {
    buffer_pool: Arc<BufferPool>,
    cols: Vec<ColumnDescriptor>,
    key_len: usize,
    current_leaf: Option<PageId>,
    idx_in_leaf: usize,
}

impl Iterator for IndexScan {
    type Item = StorageResult<(Vec<u8>, Rid)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf_pid = self.current_leaf?;
            let pod = match self.buffer_pool.fetch_page(leaf_pid) {
                Ok(p) => p,
                Err(e) => return Some(Err(e)),
            };
            let mut guard = pod.wl();
            let node = NodeHandle::new(&mut guard.data, &self.cols, self.key_len);
            if self.idx_in_leaf < node.num_key() {
                let key = node.leaf_key(self.idx_in_leaf).to_vec();
                let rid = node.leaf_rid(self.idx_in_leaf);
                self.idx_in_leaf += 1;
                drop(guard);
                if let Err(e) = self.buffer_pool.unpin_page(leaf_pid, false) {
                    return Some(Err(e));
                }
                return Some(Ok((key, rid)));
            }
            let next = node.next_leaf();
            drop(guard);
            if let Err(e) = self.buffer_pool.unpin_page(leaf_pid, false) {
                return Some(Err(e));
            }
            self.idx_in_leaf = 0;
            self.current_leaf = if next.is_valid() { Some(next) } else { None };
            if self.current_leaf.is_none() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::column::{encode_int, ColumnDescriptor};

    fn setup(name: &str) -> (Arc<DiskManager>, Arc<BufferPool>, std::path::PathBuf) {
        let disk = Arc::new(DiskManager::new());
        let pool = Arc::new(BufferPool::with_capacity(disk.clone(), 64));
        let mut path = std::env::temp_dir();
        path.push(format!("storage_core_ix_{}_{}_{:?}", name, std::process::id(), std::thread::current().id()));
        let _ = std::fs::remove_file(&path);
        (disk, pool, path)
    }

    #[test]
    fn insert_and_get_round_trip() {
        let (disk, pool, path) = setup("get");
        let cols = vec![ColumnDescriptor::int()];
        let ix = BPlusTreeIndex::create(&path, cols, disk, pool).unwrap();
        let tx = Transaction::new();
        for v in 0..200 {
            ix.insert_entry(&tx, &encode_int(v), Rid::new(v, 0)).unwrap();
        }
        for v in 0..200 {
            assert_eq!(ix.get_value(&encode_int(v)).unwrap(), Some(Rid::new(v, 0)));
        }
        assert_eq!(ix.get_value(&encode_int(999)).unwrap(), None);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (disk, pool, path) = setup("dup");
        let cols = vec![ColumnDescriptor::int()];
        let ix = BPlusTreeIndex::create(&path, cols, disk, pool).unwrap();
        let tx = Transaction::new();
        ix.insert_entry(&tx, &encode_int(1), Rid::new(1, 0)).unwrap();
        assert!(matches!(
            ix.insert_entry(&tx, &encode_int(1), Rid::new(1, 1)),
            Err(StorageError::IndexEntryAlreadyExists)
        ));
    }

    #[test]
    fn scan_returns_ascending_order_after_splits() {
        let (disk, pool, path) = setup("scan");
        let cols = vec![ColumnDescriptor::int()];
        let ix = BPlusTreeIndex::create(&path, cols, disk, pool).unwrap();
        let tx = Transaction::new();
        for v in (0..300).rev() {
            ix.insert_entry(&tx, &encode_int(v), Rid::new(v, 0)).unwrap();
        }
        let got: Vec<i32> = ix
            .scan(None)
            .unwrap()
            .map(|r| crate::column::decode_int(&r.unwrap().0))
            .collect();
        let expect: Vec<i32> = (0..300).collect();
        assert_eq!(got, expect);
    }

    #[test]
    fn delete_then_missing_lookup() {
        let (disk, pool, path) = setup("delete");
        let cols = vec![ColumnDescriptor::int()];
        let ix = BPlusTreeIndex::create(&path, cols, disk, pool).unwrap();
        let tx = Transaction::new();
        for v in 0..200 {
            ix.insert_entry(&tx, &encode_int(v), Rid::new(v, 0)).unwrap();
        }
        for v in 0..150 {
            ix.delete_entry(&tx, &encode_int(v)).unwrap();
        }
        ix.commit(&tx).unwrap();
        for v in 0..150 {
            assert_eq!(ix.get_value(&encode_int(v)).unwrap(), None);
        }
        for v in 150..200 {
            assert_eq!(ix.get_value(&encode_int(v)).unwrap(), Some(Rid::new(v, 0)));
        }
        assert!(matches!(
            ix.delete_entry(&tx, &encode_int(0)),
            Err(StorageError::IndexEntryNotFound)
        ));
    }

    #[test]
    fn delete_all_leaves_an_empty_tree() {
        let (disk, pool, path) = setup("delete_all");
        let cols = vec![ColumnDescriptor::int()];
        let ix = BPlusTreeIndex::create(&path, cols, disk, pool).unwrap();
        let tx = Transaction::new();
        for v in 0..64 {
            ix.insert_entry(&tx, &encode_int(v), Rid::new(v, 0)).unwrap();
        }
        for v in 0..64 {
            ix.delete_entry(&tx, &encode_int(v)).unwrap();
        }
        ix.commit(&tx).unwrap();
        assert_eq!(ix.scan(None).unwrap().count(), 0);
    }
}
