//! Reader-writer lock a range list is shared behind.

use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};

/// A range list guarded by its own reader-writer lock.
///
/// Queries take the shared guard, structural edits the exclusive one. A
/// guard covers a whole batch of edits and is released when dropped, on
/// every exit path.
#[derive(Debug, Default)]
pub struct SharedRangeList<L> {
    inner: RwLock<L>,
}

impl<L> SharedRangeList<L> {
    /// Wrap a list.
    pub fn new(list: L) -> Self {
        Self {
            inner: RwLock::new(list),
        }
    }

    /// Acquire shared access for queries.
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, L> {
        self.inner.read()
    }

    /// Acquire exclusive access for structural edits.
    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, L> {
        self.inner.write()
    }

    /// Acquire shared access that can later be upgraded to exclusive access
    /// without letting another writer in between.
    #[inline]
    pub fn upgradable_read(&self) -> RwLockUpgradableReadGuard<'_, L> {
        self.inner.upgradable_read()
    }

    /// Exclusive access through a unique borrow, no locking needed.
    #[inline]
    pub fn get_mut(&mut self) -> &mut L {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> L {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NonOverlappingRangeList;
    use memtrack_core::Range;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn batched_edits_are_atomic_to_readers() {
        let shared = Arc::new(SharedRangeList::new(NonOverlappingRangeList::<Range>::new()));

        let writer = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                for i in 0..200u64 {
                    let mut list = shared.write();
                    list.get_or_add_regions(i * 16, 16, Range::new).unwrap();
                    let index = list.binary_search(i * 16).unwrap();
                    list.split(index, i * 16 + 8).unwrap();
                }
            })
        };

        for _ in 0..200 {
            let list = shared.read();
            assert!(list.check_invariants().is_ok());
            // Splits happen under the same guard, so readers only ever see
            // an even number of items.
            assert_eq!(list.len() % 2, 0);
        }

        writer.join().unwrap();
        assert_eq!(shared.read().len(), 400);
    }

    #[test]
    fn upgrade_keeps_snapshot_valid() {
        let shared = SharedRangeList::new(NonOverlappingRangeList::new());
        shared.write().add(Range::new(0, 32)).unwrap();

        let guard = shared.upgradable_read();
        let index = guard.binary_search(0).unwrap();
        let mut list = RwLockUpgradableReadGuard::upgrade(guard);
        list.split(index, 16).unwrap();
        drop(list);

        assert_eq!(shared.read().items(), &[Range::new(0, 16), Range::new(16, 16)]);
    }
}
