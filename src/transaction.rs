use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Mutex;

use crate::page_id::PageId;
use crate::rid::Rid;

static NEXT_TX_ID: AtomicU32 = AtomicU32::new(1);

pub type TransactionId = u32;

/// Read-only vs. read-write intent for a page fetch, translated into the
/// shared or exclusive latch taken on that page's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lock {
    SLock,
    XLock,
}

impl Permission {
    pub fn to_lock(self) -> Lock {
        match self {
            Permission::ReadOnly => Lock::SLock,
            Permission::ReadWrite => Lock::XLock,
        }
    }
}

#[derive(Debug, Clone)]
pub enum WriteUndo {
    Insert { page: PageId, rid: Rid },
    Delete { page: PageId, rid: Rid, key: Vec<u8> },
}

/// Not a transaction manager: this crate has none. `Transaction` is only
/// the bag of bookkeeping a latch-crabbing descent and its caller need to
/// carry around — which pages are still latched (so they can be released in
/// FIFO order once a subtree proves safe), which index pages were freed by
/// a coalesce and must not be reused until the caller commits, and which
/// writes would need to be undone if the caller aborts.
pub struct Transaction {
    id: TransactionId,
    latched_pages: Mutex<VecDeque<PageId>>,
    pages_to_delete: Mutex<VecDeque<PageId>>,
    undo_log: Mutex<Vec<WriteUndo>>,
}

impl Transaction {
    pub fn new() -> Self {
        let id = NEXT_TX_ID.fetch_add(1, AtomicOrdering::SeqCst);
        Transaction {
            id,
            latched_pages: Mutex::new(VecDeque::new()),
            pages_to_delete: Mutex::new(VecDeque::new()),
            undo_log: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Records that `page` is currently latched by this descent. Crabbing
    /// releases latches front-to-back (the root first) once a node proves
    /// safe, so this is a FIFO, not a stack.
    pub fn push_latch(&self, page: PageId) {
        self.latched_pages.lock().unwrap().push_back(page);
    }

    pub fn pop_oldest_latch(&self) -> Option<PageId> {
        self.latched_pages.lock().unwrap().pop_front()
    }

    pub fn drain_latches(&self) -> Vec<PageId> {
        self.latched_pages.lock().unwrap().drain(..).collect()
    }

    pub fn queue_page_for_deletion(&self, page: PageId) {
        self.pages_to_delete.lock().unwrap().push_back(page);
    }

    pub fn take_pages_to_delete(&self) -> Vec<PageId> {
        self.pages_to_delete.lock().unwrap().drain(..).collect()
    }

    pub fn record_undo(&self, undo: WriteUndo) {
        self.undo_log.lock().unwrap().push(undo);
    }

    pub fn undo_log(&self) -> Vec<WriteUndo> {
        self.undo_log.lock().unwrap().clone()
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}
