use std::sync::{Arc, RwLock};

/// A reference-counted, internally-synchronized handle. Most long-lived
/// shared structures in this crate (pages, frozen memtables) are passed
/// around as `Pod<T>` rather than behind a raw `Arc<T>` so callers can take
/// either a read or a write latch on the same handle.
pub type Pod<T> = Arc<RwLock<T>>;

pub fn new_pod<T>(v: T) -> Pod<T> {
    Arc::new(RwLock::new(v))
}

/// Shortcuts for the common case of an uncontested `.read()`/`.write()`
/// where a poisoned lock is itself a bug worth panicking on, not a
/// recoverable error. Named the way TiKV's `tikv_util::HandyRwLock` is.
pub trait HandyRwLock<T> {
    fn rl(&self) -> std::sync::RwLockReadGuard<'_, T>;
    fn wl(&self) -> std::sync::RwLockWriteGuard<'_, T>;
}

impl<T> HandyRwLock<T> for RwLock<T> {
    fn rl(&self) -> std::sync::RwLockReadGuard<'_, T> {
        self.read().unwrap()
    }

    fn wl(&self) -> std::sync::RwLockWriteGuard<'_, T> {
        self.write().unwrap()
    }
}
