//! Per-buffer dirty range tracking.

use std::ops::Range as IndexRange;
use std::sync::{Arc, OnceLock};

use memtrack_core::{sync_diff, Range, Result, SyncNumber};
use memtrack_range::{NonOverlappingRangeList, RangeItem};
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};

use crate::buffer::TrackedBuffer;
use crate::config::TrackerConfig;
use crate::context::SyncContext;
use crate::migration::{BufferMigration, MigrationSpan};
use crate::modified::{ModifiedRange, TrackerId};

type ModifiedList = NonOverlappingRangeList<ModifiedRange>;

/// Tracks the ranges of one buffer written by the GPU and not yet flushed.
///
/// Every write is stamped with the sync number of the batch it was recorded
/// in. Flushing waits for the newest batch that is already closed and copies
/// back everything up to it, leaving writes of the open batch alone.
///
/// A tracker that has been replaced by another one (see
/// [`inherit_ranges`](Self::inherit_ranges)) forwards flushes to its
/// replacement.
pub struct DirtyRangeTracker {
    id: TrackerId,
    context: Arc<dyn SyncContext>,
    buffer: Arc<dyn TrackedBuffer>,
    ranges: RwLock<ModifiedList>,
    /// Migration keeping replaced storage flushable.
    ///
    /// Replaced only while `ranges` is write-locked. Retirement clears it
    /// without touching `ranges`, so it never waits behind a flush.
    source: Mutex<Option<Arc<BufferMigration>>>,
    migration_target: OnceLock<Arc<DirtyRangeTracker>>,
}

impl DirtyRangeTracker {
    /// Create a tracker for `buffer` with the default configuration.
    pub fn new(context: Arc<dyn SyncContext>, buffer: Arc<dyn TrackedBuffer>) -> Arc<Self> {
        Self::with_config(context, buffer, &TrackerConfig::default())
    }

    pub fn with_config(
        context: Arc<dyn SyncContext>,
        buffer: Arc<dyn TrackedBuffer>,
        config: &TrackerConfig,
    ) -> Arc<Self> {
        let id = TrackerId::next();
        tracing::trace!(tracker = %id, range = ?buffer.range(), "created dirty range tracker");
        Arc::new(Self {
            id,
            context,
            buffer,
            ranges: RwLock::new(NonOverlappingRangeList::with_capacity(config.initial_capacity)),
            source: Mutex::new(None),
            migration_target: OnceLock::new(),
        })
    }

    #[inline]
    pub const fn id(&self) -> TrackerId {
        self.id
    }

    /// Storage this tracker flushes to.
    #[inline]
    pub fn buffer(&self) -> &Arc<dyn TrackedBuffer> {
        &self.buffer
    }

    /// Tracker that took over this one's ranges, if any.
    #[inline]
    pub fn migration_target(&self) -> Option<&Arc<Self>> {
        self.migration_target.get()
    }

    /// Whether a migration is still keeping replaced storage flushable.
    pub fn has_migration(&self) -> bool {
        self.source.lock().is_some()
    }

    /// Record a GPU write to `[address, address + size)` in the current batch.
    #[cfg_attr(feature = "trace-spans", tracing::instrument(level = "trace", skip_all))]
    pub fn signal_modified(&self, address: u64, size: u64) {
        if size == 0 {
            return;
        }
        let end_address = address.saturating_add(size);
        let sync_number = self.context.sync_number();

        let mut ranges = self.ranges.write();
        let span = ranges.binary_search_edges(address, end_address);

        if span.len() == 1 {
            if let Some(existing) = ranges.get_mut(span.start) {
                let exact = existing.address == address && existing.end_address() == end_address;
                let covers = existing.address <= address && existing.end_address() >= end_address;
                if exact || (covers && existing.sync_number == sync_number) {
                    existing.sync_number = sync_number;
                    existing.parent = self.id;
                    return;
                }
            }
        }

        let entry = ModifiedRange::new(address, end_address - address, sync_number, self.id);
        let result = if span.is_empty() {
            ranges.add(entry)
        } else {
            carve(&mut ranges, address, end_address)
                .and_then(|span| ranges.replace_span(span, entry))
        };
        self.check(result, "signal_modified");
    }

    /// Report the parts of `[address, address + size)` that are not dirty.
    pub fn exclude_modified_regions<F>(&self, address: u64, size: u64, mut action: F)
    where
        F: FnMut(u64, u64),
    {
        let end_address = address.saturating_add(size);
        let dirty: Vec<Range> = {
            let ranges = self.ranges.read();
            ranges
                .overlaps(address, size)
                .iter()
                .map(RangeItem::range)
                .collect()
        };

        let mut cursor = address;
        for range in dirty {
            if range.address > cursor {
                action(cursor, range.address - cursor);
            }
            cursor = cursor.max(range.end_address());
        }
        if cursor < end_address {
            action(cursor, end_address - cursor);
        }
    }

    /// Report the dirty parts of `[address, address + size)` written in batch
    /// `sync_number`.
    pub fn get_ranges_at_sync<F>(&self, address: u64, size: u64, sync_number: SyncNumber, action: F)
    where
        F: FnMut(u64, u64),
    {
        self.report_overlaps(address, size, |range| range.sync_number == sync_number, action);
    }

    /// Report every dirty part of `[address, address + size)`.
    pub fn get_ranges<F>(&self, address: u64, size: u64, action: F)
    where
        F: FnMut(u64, u64),
    {
        self.report_overlaps(address, size, |_| true, action);
    }

    /// Check whether any part of `[address, address + size)` is dirty.
    pub fn has_range(&self, address: u64, size: u64) -> bool {
        self.ranges.read().find_overlap(address, size).is_some()
    }

    /// Check whether anything is dirty.
    pub fn has_ranges(&self) -> bool {
        !self.ranges.read().is_empty()
    }

    /// Wait for and flush the dirty parts of `[address, address + size)`.
    ///
    /// Picks the newest closed batch among the overlapping entries, waits for
    /// it once and flushes every entry up to it. Entries of the open batch
    /// stay dirty. Forwards to the migration target when there is one.
    #[cfg_attr(feature = "trace-spans", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_for_and_flush_ranges(&self, address: u64, size: u64) {
        let mut tracker = self;
        loop {
            if let Some(target) = tracker.migration_target.get() {
                tracker = target;
                continue;
            }

            let ranges = tracker.ranges.upgradable_read();
            // The target is set under this lock, so a migration that landed
            // while we waited for it is still observed here.
            if let Some(target) = tracker.migration_target.get() {
                drop(ranges);
                tracker = target;
                continue;
            }

            tracker.flush_locked(ranges, address, size);
            return;
        }
    }

    fn flush_locked(
        &self,
        ranges: RwLockUpgradableReadGuard<'_, ModifiedList>,
        address: u64,
        size: u64,
    ) {
        let current = self.context.sync_number();
        let Some(highest) = ranges
            .overlaps(address, size)
            .iter()
            .map(|range| sync_diff(range.sync_number, current))
            .filter(|&diff| diff < 0)
            .max()
        else {
            return;
        };

        let wait_sync = current.wrapping_add_signed(highest);
        self.context.wait_sync(wait_sync);

        let mut ranges = RwLockUpgradableReadGuard::upgrade(ranges);
        let source = self.source.lock().clone();

        let query = Range::clamped(address, size);
        let targets: Vec<Range> = ranges
            .overlaps(address, size)
            .iter()
            .filter(|range| sync_diff(range.sync_number, current) <= highest)
            .filter_map(|range| range.range().intersection(query))
            .collect();

        tracing::trace!(
            tracker = %self.id,
            wait_sync,
            count = targets.len(),
            "flushing modified ranges"
        );

        for target in targets {
            let result = cut(&mut ranges, target.address, target.end_address());
            self.check(result, "wait_for_and_flush_ranges");
            self.flush_through(source.as_ref(), target.address, target.size, wait_sync);
        }
    }

    fn flush_through(
        &self,
        source: Option<&Arc<BufferMigration>>,
        address: u64,
        size: u64,
        sync_number: SyncNumber,
    ) {
        match source {
            Some(migration) => {
                migration.range_action_with_migration(address, size, sync_number, &*self.buffer);
            }
            None => self.buffer.flush(address, size, sync_number),
        }
    }

    /// Forget the dirty parts of `[address, address + size)` without flushing.
    pub fn clear(&self, address: u64, size: u64) {
        let mut ranges = self.ranges.write();
        let result = cut(&mut ranges, address, address.saturating_add(size));
        self.check(result, "clear");
    }

    /// Keep the storage being replaced in place flushable.
    ///
    /// `snapshot` holds the old contents; flushes for batches recorded before
    /// the replacement go there until the migration retires.
    pub fn self_migration(self: &Arc<Self>, snapshot: Arc<dyn TrackedBuffer>) {
        let migration = {
            let _ranges = self.ranges.write();
            let mut source = self.source.lock();
            let span = MigrationSpan::new(snapshot, source.take());
            let migration =
                BufferMigration::new(vec![span], Arc::downgrade(self), self.context.sync_number());
            *source = Some(Arc::clone(&migration));
            migration
        };

        tracing::debug!(
            tracker = %self.id,
            sync_number = migration.sync_number(),
            "registered self migration"
        );
        self.context.register_migration(migration);
    }

    /// Take over the dirty ranges of `old`, whose buffer this one replaces.
    ///
    /// `old` stays flushable through a migration and forwards its flushes
    /// here from now on. `register` is called for every inherited range that
    /// is not in the open batch.
    pub fn inherit_ranges<F>(self: &Arc<Self>, old: &Arc<Self>, mut register: F)
    where
        F: FnMut(u64, u64),
    {
        if Arc::ptr_eq(self, old) {
            tracing::warn!(tracker = %self.id, "tracker cannot inherit its own ranges");
            return;
        }

        let (inherited, created) = {
            let old_ranges = old.ranges.write();
            let mut ranges = self.ranges.write();

            let inherited = old_ranges.items().to_vec();
            let span = MigrationSpan::new(Arc::clone(&old.buffer), old.source.lock().clone());
            let sync_number = self.context.sync_number();
            let mut source = self.source.lock();
            let active = source.take().filter(|migration| !migration.is_disposed());
            let created = match active {
                // Same batch: the copy retires together with it.
                Some(migration) if migration.sync_number() == sync_number => {
                    migration.add_span_to_end(span);
                    *source = Some(migration);
                    None
                }
                previous => {
                    let migration = BufferMigration::superseding(
                        vec![span],
                        previous,
                        Arc::downgrade(self),
                        sync_number,
                    );
                    *source = Some(Arc::clone(&migration));
                    Some(migration)
                }
            };
            drop(source);

            if old.migration_target.set(Arc::clone(self)).is_err() {
                tracing::warn!(
                    tracker = %old.id,
                    "tracker already migrated, keeping its first target"
                );
            }

            for range in &inherited {
                let result = ranges
                    .get_or_add_regions(range.address, range.size, |address, size| {
                        ModifiedRange::new(address, size, range.sync_number, range.parent)
                    })
                    .map(|_| ());
                self.check(result, "inherit_ranges");
            }

            (inherited, created)
        };

        tracing::debug!(
            tracker = %self.id,
            from = %old.id,
            count = inherited.len(),
            "inherited modified ranges"
        );

        if let Some(migration) = created {
            self.context.register_migration(migration);
        }

        let current = self.context.sync_number();
        for range in inherited.iter().filter(|range| range.sync_number != current) {
            register(range.address, range.size);
        }
    }

    /// Drop the active migration if it is still `migration`.
    pub fn remove_migration(&self, migration: &Arc<BufferMigration>) {
        let mut source = self.source.lock();
        if source
            .as_ref()
            .is_some_and(|source| Arc::ptr_eq(source, migration))
        {
            *source = None;
        }
    }

    /// Report every range not in the open batch.
    pub fn reregister_ranges<F>(&self, mut register: F)
    where
        F: FnMut(u64, u64),
    {
        let current = self.context.sync_number();
        let ranges: Vec<Range> = self
            .ranges
            .read()
            .iter()
            .filter(|range| range.sync_number != current)
            .map(RangeItem::range)
            .collect();

        for range in ranges {
            register(range.address, range.size);
        }
    }

    /// Copy of every tracked entry in address order.
    pub fn snapshot(&self) -> Vec<ModifiedRange> {
        self.ranges.read().items().to_vec()
    }

    fn report_overlaps<P, F>(&self, address: u64, size: u64, mut keep: P, mut action: F)
    where
        P: FnMut(&ModifiedRange) -> bool,
        F: FnMut(u64, u64),
    {
        let query = Range::clamped(address, size);
        let found: Vec<Range> = {
            let ranges = self.ranges.read();
            ranges
                .overlaps(address, size)
                .iter()
                .filter(|range| keep(range))
                .filter_map(|range| range.range().intersection(query))
                .collect()
        };

        for range in found {
            action(range.address, range.size);
        }
    }

    #[track_caller]
    fn check<T>(&self, result: Result<T>, operation: &str) -> T {
        match result {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(
                    tracker = %self.id,
                    operation,
                    error = %err,
                    "modified range list invariant violated"
                );
                panic!("{operation} on {}: {err}", self.id);
            }
        }
    }
}

impl std::fmt::Debug for DirtyRangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyRangeTracker")
            .field("id", &self.id)
            .field("range", &self.buffer.range())
            .field("migrated", &self.migration_target.get().map(|t| t.id))
            .finish_non_exhaustive()
    }
}

/// Split the entries straddling `address` and `end_address` so the overlapping
/// run lies exactly inside the bounds. Returns that run.
fn carve(ranges: &mut ModifiedList, address: u64, end_address: u64) -> Result<IndexRange<usize>> {
    let mut span = ranges.binary_search_edges(address, end_address);
    if span.is_empty() {
        return Ok(span);
    }

    if ranges.items()[span.start].address < address {
        span.start = ranges.split(span.start, address)?;
        span.end += 1;
    }
    let last = span.end - 1;
    if ranges.items()[last].end_address() > end_address {
        ranges.split(last, end_address)?;
    }
    Ok(span)
}

/// Remove the parts of entries inside `[address, end_address)`.
fn cut(ranges: &mut ModifiedList, address: u64, end_address: u64) -> Result<Vec<ModifiedRange>> {
    let span = carve(ranges, address, end_address)?;
    if span.is_empty() {
        return Ok(Vec::new());
    }
    Ok(ranges.remove_range(address, end_address - address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CallbackBuffer;
    use crate::context::SyncTimeline;

    type FlushLog = Arc<Mutex<Vec<(u64, u64, SyncNumber)>>>;

    fn tracker_on(timeline: &Arc<SyncTimeline>) -> (Arc<DirtyRangeTracker>, FlushLog) {
        let log = FlushLog::default();
        let sink = Arc::clone(&log);
        let buffer = CallbackBuffer::new(Range::new(0, 0x1000), move |a, s, n| {
            sink.lock().push((a, s, n));
        });
        let context: Arc<dyn SyncContext> = timeline.clone();
        (DirtyRangeTracker::new(context, Arc::new(buffer)), log)
    }

    fn entries(tracker: &DirtyRangeTracker) -> Vec<(u64, u64, SyncNumber)> {
        tracker
            .snapshot()
            .iter()
            .map(|r| (r.address, r.size, r.sync_number))
            .collect()
    }

    #[test]
    fn write_inside_older_entry_splits_it() {
        let timeline = Arc::new(SyncTimeline::starting_at(1));
        let (tracker, _) = tracker_on(&timeline);

        tracker.signal_modified(0, 20);
        timeline.create_sync();
        tracker.signal_modified(10, 5);

        assert_eq!(entries(&tracker), vec![(0, 10, 1), (10, 5, 2), (15, 5, 1)]);
        let covered: u64 = tracker.snapshot().iter().map(|r| r.size).sum();
        assert_eq!(covered, 20);
    }

    #[test]
    fn write_in_current_batch_updates_in_place() {
        let timeline = Arc::new(SyncTimeline::new());
        let (tracker, _) = tracker_on(&timeline);

        tracker.signal_modified(0, 20);
        tracker.signal_modified(5, 5);
        assert_eq!(entries(&tracker), vec![(0, 20, 0)]);

        timeline.create_sync();
        tracker.signal_modified(0, 20);
        assert_eq!(entries(&tracker), vec![(0, 20, 1)]);
    }

    #[test]
    fn write_across_entries_merges_them() {
        let timeline = Arc::new(SyncTimeline::new());
        let (tracker, _) = tracker_on(&timeline);

        tracker.signal_modified(0, 10);
        tracker.signal_modified(20, 10);
        tracker.signal_modified(40, 10);
        timeline.create_sync();
        tracker.signal_modified(5, 40);

        assert_eq!(entries(&tracker), vec![(0, 5, 0), (5, 40, 1), (45, 5, 0)]);
        assert!(tracker.has_range(5, 40));
    }

    #[test]
    fn exclude_reports_clean_parts() {
        let timeline = Arc::new(SyncTimeline::new());
        let (tracker, _) = tracker_on(&timeline);
        tracker.signal_modified(10, 10);

        let mut clean = Vec::new();
        tracker.exclude_modified_regions(0, 30, |a, s| clean.push((a, s)));
        assert_eq!(clean, vec![(0, 10), (20, 10)]);
    }

    #[test]
    fn get_ranges_clips_and_filters() {
        let timeline = Arc::new(SyncTimeline::new());
        let (tracker, _) = tracker_on(&timeline);
        tracker.signal_modified(0, 10);
        timeline.create_sync();
        tracker.signal_modified(20, 10);

        let mut all = Vec::new();
        tracker.get_ranges(5, 20, |a, s| all.push((a, s)));
        assert_eq!(all, vec![(5, 5), (20, 5)]);

        let mut at_one = Vec::new();
        tracker.get_ranges_at_sync(0, 100, 1, |a, s| at_one.push((a, s)));
        assert_eq!(at_one, vec![(20, 10)]);
    }

    #[test]
    fn clear_cuts_without_flushing() {
        let timeline = Arc::new(SyncTimeline::starting_at(1));
        let (tracker, log) = tracker_on(&timeline);
        tracker.signal_modified(10, 10);
        timeline.create_sync();
        tracker.signal_modified(40, 20);

        tracker.clear(0, 50);
        assert_eq!(entries(&tracker), vec![(50, 10, 2)]);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn flush_leaves_open_batch_alone() {
        let timeline = Arc::new(SyncTimeline::new());
        let (tracker, log) = tracker_on(&timeline);

        tracker.signal_modified(0, 10);
        timeline.create_sync();
        tracker.signal_modified(10, 10);
        timeline.create_sync();
        tracker.signal_modified(20, 10);
        timeline.signal_all();

        tracker.wait_for_and_flush_ranges(0, 30);
        assert_eq!(*log.lock(), vec![(0, 10, 1), (10, 10, 1)]);
        assert_eq!(entries(&tracker), vec![(20, 10, 2)]);

        // Nothing but the open batch is left, so no wait and no flush.
        tracker.wait_for_and_flush_ranges(0, 30);
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn flush_shrinks_entries_past_query() {
        let timeline = Arc::new(SyncTimeline::new());
        let (tracker, log) = tracker_on(&timeline);
        tracker.signal_modified(0, 100);
        timeline.create_sync();
        timeline.signal_all();

        tracker.wait_for_and_flush_ranges(40, 20);
        assert_eq!(*log.lock(), vec![(40, 20, 0)]);
        assert_eq!(entries(&tracker), vec![(0, 40, 0), (60, 40, 0)]);
    }

    #[test]
    fn queries_past_address_space_end_are_clipped() {
        let timeline = Arc::new(SyncTimeline::new());
        let (tracker, log) = tracker_on(&timeline);
        let address = u64::MAX - 16;
        tracker.signal_modified(address, 8);

        let mut all = Vec::new();
        tracker.get_ranges(address, 32, |a, s| all.push((a, s)));
        assert_eq!(all, vec![(address, 8)]);

        let mut at_zero = Vec::new();
        tracker.get_ranges_at_sync(address, 32, 0, |a, s| at_zero.push((a, s)));
        assert_eq!(at_zero, vec![(address, 8)]);

        timeline.create_sync();
        timeline.signal_all();
        tracker.wait_for_and_flush_ranges(address, 32);
        assert_eq!(*log.lock(), vec![(address, 8, 0)]);
        assert!(!tracker.has_range(address, 32));
    }

    #[test]
    fn reregister_skips_open_batch() {
        let timeline = Arc::new(SyncTimeline::new());
        let (tracker, _) = tracker_on(&timeline);
        tracker.signal_modified(0, 10);
        timeline.create_sync();
        tracker.signal_modified(20, 10);

        let mut registered = Vec::new();
        tracker.reregister_ranges(|a, s| registered.push((a, s)));
        assert_eq!(registered, vec![(0, 10)]);
    }

    #[test]
    fn random_writes_keep_list_disjoint() {
        let timeline = Arc::new(SyncTimeline::new());
        let (tracker, _) = tracker_on(&timeline);

        let mut seed = 0x2545_f491_u64;
        for step in 0..500 {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let address = (seed >> 33) % 0x400;
            let size = (seed >> 20) % 0x40 + 1;
            match step % 7 {
                0 => tracker.clear(address, size),
                3 => {
                    timeline.create_sync();
                }
                _ => tracker.signal_modified(address, size),
            }
            assert!(tracker.ranges.read().check_invariants().is_ok());
        }
    }
}
