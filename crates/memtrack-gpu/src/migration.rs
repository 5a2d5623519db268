//! Buffer migrations.
//!
//! When a tracker's storage is replaced, writes recorded before the switch may
//! still be in flight against the old storage. A [`BufferMigration`] keeps the
//! old storage flushable until the GPU has passed the sync number the switch
//! happened at, then lets go of it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use memtrack_core::{sync_diff, Range, SyncNumber};
use parking_lot::RwLock;

use crate::buffer::TrackedBuffer;
use crate::tracker::DirtyRangeTracker;

/// One piece of old storage a migration keeps alive.
pub struct MigrationSpan {
    buffer: Arc<dyn TrackedBuffer>,
    /// The migration that was active on the old storage, if any.
    source: Option<Arc<BufferMigration>>,
}

impl MigrationSpan {
    pub fn new(buffer: Arc<dyn TrackedBuffer>, source: Option<Arc<BufferMigration>>) -> Self {
        Self { buffer, source }
    }

    /// Address range of the old storage.
    #[inline]
    pub fn range(&self) -> Range {
        self.buffer.range()
    }

    fn flush(&self, address: u64, size: u64, sync_number: SyncNumber) {
        match &self.source {
            Some(source) => {
                source.range_action_with_migration(address, size, sync_number, &*self.buffer);
            }
            None => self.buffer.flush(address, size, sync_number),
        }
    }
}

impl fmt::Debug for MigrationSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationSpan")
            .field("range", &self.buffer.range())
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Debug)]
struct MigrationState {
    spans: Vec<MigrationSpan>,
    /// Migration this one superseded on the destination. Parts no span
    /// covers are routed through it instead of straight to the destination.
    previous: Option<Arc<BufferMigration>>,
}

/// Old storage kept flushable on behalf of a destination tracker.
pub struct BufferMigration {
    state: RwLock<MigrationState>,
    destination: Weak<DirtyRangeTracker>,
    /// Sync number the destination took over at.
    sync_number: SyncNumber,
    disposed: AtomicBool,
}

impl BufferMigration {
    pub fn new(
        spans: Vec<MigrationSpan>,
        destination: Weak<DirtyRangeTracker>,
        sync_number: SyncNumber,
    ) -> Arc<Self> {
        Self::superseding(spans, None, destination, sync_number)
    }

    /// Create a migration that takes over from `previous`, the destination's
    /// still active migration of an older batch.
    pub fn superseding(
        spans: Vec<MigrationSpan>,
        previous: Option<Arc<Self>>,
        destination: Weak<DirtyRangeTracker>,
        sync_number: SyncNumber,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(MigrationState { spans, previous }),
            destination,
            sync_number,
            disposed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub const fn sync_number(&self) -> SyncNumber {
        self.sync_number
    }

    pub fn span_count(&self) -> usize {
        self.state.read().spans.len()
    }

    /// Append another piece of old storage.
    ///
    /// Only valid while the destination's copy is recorded in this
    /// migration's batch.
    pub fn add_span_to_end(&self, span: MigrationSpan) {
        self.state.write().spans.push(span);
    }

    /// Flush `[address, address + size)` for a wait on `sync_number`.
    ///
    /// Once the destination took over at or before `sync_number` it holds the
    /// data and `destination` flushes it. Older waits go to the spans, through
    /// their own migrations, and whatever no span covers falls back to the
    /// superseded migration, or to `destination` when there is none.
    #[cfg_attr(feature = "trace-spans", tracing::instrument(level = "trace", skip_all))]
    pub fn range_action_with_migration(
        &self,
        address: u64,
        size: u64,
        sync_number: SyncNumber,
        destination: &dyn TrackedBuffer,
    ) {
        if sync_diff(sync_number, self.sync_number) >= 0 {
            destination.flush(address, size, sync_number);
            return;
        }

        let query = Range::clamped(address, size);
        let state = self.state.read();

        // Earlier spans take precedence where spans overlap.
        let mut covered: Vec<Range> = Vec::new();
        for span in &state.spans {
            let Some(part) = span.range().intersection(query) else {
                continue;
            };
            for gap in uncovered(&covered, part) {
                span.flush(gap.address, gap.size, sync_number);
            }
            let index = covered.partition_point(|c| c.address < part.address);
            covered.insert(index, part);
        }

        for gap in uncovered(&covered, query) {
            match &state.previous {
                Some(previous) => previous.range_action_with_migration(
                    gap.address,
                    gap.size,
                    sync_number,
                    destination,
                ),
                None => destination.flush(gap.address, gap.size, sync_number),
            }
        }
    }

    /// Release the old storage and detach from the destination.
    ///
    /// Runs at most once.
    pub fn dispose(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let spans = {
            let mut state = self.state.write();
            state.previous = None;
            std::mem::take(&mut state.spans)
        };
        for span in &spans {
            span.buffer.release();
        }
        tracing::trace!(
            sync_number = self.sync_number,
            spans = spans.len(),
            "disposed buffer migration"
        );

        if let Some(destination) = self.destination.upgrade() {
            destination.remove_migration(self);
        }
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Parts of `query` not covered by `covered`, which is sorted by address.
fn uncovered(covered: &[Range], query: Range) -> Vec<Range> {
    let mut gaps = Vec::new();
    let mut cursor = query.address;
    let end_address = query.end_address();
    for part in covered {
        if part.end_address() <= cursor || part.address >= end_address {
            continue;
        }
        if part.address > cursor {
            gaps.push(Range::new(cursor, part.address - cursor));
        }
        cursor = cursor.max(part.end_address());
    }
    if cursor < end_address {
        gaps.push(Range::new(cursor, end_address - cursor));
    }
    gaps
}

impl fmt::Debug for BufferMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferMigration")
            .field("sync_number", &self.sync_number)
            .field("spans", &self.span_count())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
