//! GPU sync context.
//!
//! The tracking layer does not own GPU synchronization. It asks a
//! [`SyncContext`] for the sync number new writes are stamped with, blocks on
//! it until older numbers retire, and hands it migrations to keep alive until
//! their copy has landed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memtrack_core::{sync_diff, SyncNumber};
use parking_lot::{Condvar, Mutex};

use crate::migration::BufferMigration;

/// Source of sync numbers and sync waits.
pub trait SyncContext: Send + Sync {
    /// Sync number of the batch currently being recorded.
    fn sync_number(&self) -> SyncNumber;

    /// Block until `sync_number` has retired on the GPU.
    fn wait_sync(&self, sync_number: SyncNumber);

    /// Keep `migration` alive until its sync number retires, then dispose it.
    fn register_migration(&self, migration: Arc<BufferMigration>);
}

/// In-process sync timeline.
///
/// Batches are closed with [`create_sync`](Self::create_sync) and retired in
/// order with [`signal`](Self::signal). Registered migrations are disposed
/// once the batch they were registered in retires.
#[derive(Debug)]
pub struct SyncTimeline {
    /// Sync number of the open batch.
    current: AtomicU64,
    /// Every sync number before this one has retired.
    retired_before: Mutex<SyncNumber>,
    retired: Condvar,
    /// Migrations waiting for their batch to retire.
    migrations: Mutex<Vec<Arc<BufferMigration>>>,
}

impl Default for SyncTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTimeline {
    /// Create a timeline whose first batch is sync number 0.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Create a timeline whose first batch is `sync_number`.
    pub fn starting_at(sync_number: SyncNumber) -> Self {
        Self {
            current: AtomicU64::new(sync_number),
            retired_before: Mutex::new(sync_number),
            retired: Condvar::new(),
            migrations: Mutex::new(Vec::new()),
        }
    }

    /// Close the open batch and return its sync number.
    pub fn create_sync(&self) -> SyncNumber {
        let closed = self.current.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(sync_number = closed, "closed sync batch");
        closed
    }

    /// Mark every batch up to and including `sync_number` as retired.
    ///
    /// Wakes waiters and disposes migrations whose batch retired.
    pub fn signal(&self, sync_number: SyncNumber) {
        let retired_before = {
            let mut retired_before = self.retired_before.lock();
            let next = sync_number.wrapping_add(1);
            if sync_diff(next, *retired_before) > 0 {
                *retired_before = next;
            }
            *retired_before
        };
        self.retired.notify_all();

        let finished: Vec<Arc<BufferMigration>> = {
            let mut migrations = self.migrations.lock();
            let (finished, pending): (Vec<_>, Vec<_>) = migrations
                .drain(..)
                .partition(|m| sync_diff(m.sync_number(), retired_before) < 0);
            *migrations = pending;
            finished
        };

        // Disposal calls back into trackers; the registry lock is not held.
        for migration in &finished {
            migration.dispose();
        }
        if !finished.is_empty() {
            tracing::debug!(
                count = finished.len(),
                retired_before,
                "retired buffer migrations"
            );
        }
    }

    /// Retire every closed batch.
    pub fn signal_all(&self) {
        let current = self.current.load(Ordering::Acquire);
        self.signal(current.wrapping_sub(1));
    }

    /// Check whether `sync_number` has retired.
    pub fn is_retired(&self, sync_number: SyncNumber) -> bool {
        sync_diff(sync_number, *self.retired_before.lock()) < 0
    }

    /// Wait for `sync_number` to retire, giving up after `timeout`.
    ///
    /// Returns whether the sync number retired.
    pub fn wait_sync_timeout(&self, sync_number: SyncNumber, timeout: Duration) -> bool {
        let mut retired_before = self.retired_before.lock();
        while sync_diff(sync_number, *retired_before) >= 0 {
            if self
                .retired
                .wait_for(&mut retired_before, timeout)
                .timed_out()
            {
                return sync_diff(sync_number, *retired_before) < 0;
            }
        }
        true
    }

    /// Number of migrations waiting to retire.
    pub fn pending_migrations(&self) -> usize {
        self.migrations.lock().len()
    }
}

impl SyncContext for SyncTimeline {
    fn sync_number(&self) -> SyncNumber {
        self.current.load(Ordering::Acquire)
    }

    #[cfg_attr(feature = "trace-spans", tracing::instrument(level = "trace", skip(self)))]
    fn wait_sync(&self, sync_number: SyncNumber) {
        let mut retired_before = self.retired_before.lock();
        while sync_diff(sync_number, *retired_before) >= 0 {
            self.retired.wait(&mut retired_before);
        }
    }

    fn register_migration(&self, migration: Arc<BufferMigration>) {
        self.migrations.lock().push(migration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn create_sync_advances_current() {
        let timeline = SyncTimeline::starting_at(5);
        assert_eq!(timeline.sync_number(), 5);
        assert_eq!(timeline.create_sync(), 5);
        assert_eq!(timeline.sync_number(), 6);
    }

    #[test]
    fn signal_retires_in_order() {
        let timeline = SyncTimeline::new();
        timeline.create_sync();
        timeline.create_sync();

        assert!(!timeline.is_retired(0));
        timeline.signal(0);
        assert!(timeline.is_retired(0));
        assert!(!timeline.is_retired(1));

        // Signalling an older number never moves the watermark back.
        timeline.signal_all();
        timeline.signal(0);
        assert!(timeline.is_retired(1));
        assert!(!timeline.is_retired(2));
    }

    #[test]
    fn wait_sync_blocks_until_signalled() {
        let timeline = Arc::new(SyncTimeline::new());
        let closed = timeline.create_sync();

        let waiter = {
            let timeline = Arc::clone(&timeline);
            thread::spawn(move || timeline.wait_sync(closed))
        };

        thread::sleep(Duration::from_millis(10));
        timeline.signal(closed);
        waiter.join().unwrap();
    }

    #[test]
    fn wait_sync_timeout_gives_up() {
        let timeline = SyncTimeline::new();
        let closed = timeline.create_sync();
        assert!(!timeline.wait_sync_timeout(closed, Duration::from_millis(5)));
        timeline.signal(closed);
        assert!(timeline.wait_sync_timeout(closed, Duration::from_millis(5)));
    }
}
