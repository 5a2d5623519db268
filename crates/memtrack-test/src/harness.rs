//! Recording buffers and tracker fixtures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use memtrack_core::{Range, SyncNumber};
use memtrack_gpu::{DirtyRangeTracker, SyncContext, SyncTimeline, TrackedBuffer, TrackerConfig};
use parking_lot::Mutex;
use serde::Serialize;

/// One flush observed by a [`RecordingBuffer`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FlushRecord {
    pub buffer: String,
    pub address: u64,
    pub size: u64,
    pub sync_number: SyncNumber,
}

/// Flush records shared by several buffers, in the order they happened.
#[derive(Clone, Debug, Default)]
pub struct FlushLog {
    records: Arc<Mutex<Vec<FlushRecord>>>,
}

impl FlushLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer that records its flushes here.
    pub fn buffer(&self, name: &str, address: u64, size: u64) -> Arc<RecordingBuffer> {
        Arc::new(RecordingBuffer {
            name: name.to_owned(),
            range: Range::new(address, size),
            log: self.clone(),
            releases: AtomicUsize::new(0),
        })
    }

    pub fn records(&self) -> Vec<FlushRecord> {
        self.records.lock().clone()
    }

    /// Return the records and start over.
    pub fn take(&self) -> Vec<FlushRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Total bytes flushed by the buffer called `name`.
    pub fn bytes_flushed_by(&self, name: &str) -> u64 {
        self.records
            .lock()
            .iter()
            .filter(|record| record.buffer == name)
            .map(|record| record.size)
            .sum()
    }

    fn push(&self, record: FlushRecord) {
        self.records.lock().push(record);
    }
}

/// A [`TrackedBuffer`] that logs flushes instead of copying memory.
#[derive(Debug)]
pub struct RecordingBuffer {
    name: String,
    range: Range,
    log: FlushLog,
    releases: AtomicUsize,
}

impl RecordingBuffer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times a migration let go of this buffer.
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::Acquire)
    }
}

impl TrackedBuffer for RecordingBuffer {
    fn range(&self) -> Range {
        self.range
    }

    fn flush(&self, address: u64, size: u64, sync_number: SyncNumber) {
        tracing::trace!(buffer = %self.name, address, size, sync_number, "flush");
        self.log.push(FlushRecord {
            buffer: self.name.clone(),
            address,
            size,
            sync_number,
        });
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::AcqRel);
    }
}

/// A sync timeline plus a shared flush log for building trackers.
#[derive(Debug)]
pub struct TrackerFixture {
    pub timeline: Arc<SyncTimeline>,
    pub log: FlushLog,
    config: TrackerConfig,
}

impl Default for TrackerFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerFixture {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Fixture whose first open batch is `sync_number`.
    pub fn starting_at(sync_number: SyncNumber) -> Self {
        crate::init_tracing();
        Self {
            timeline: Arc::new(SyncTimeline::starting_at(sync_number)),
            log: FlushLog::new(),
            config: TrackerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn context(&self) -> Arc<dyn SyncContext> {
        self.timeline.clone()
    }

    /// A tracker over a fresh recording buffer called `name`.
    pub fn tracker(
        &self,
        name: &str,
        address: u64,
        size: u64,
    ) -> (Arc<DirtyRangeTracker>, Arc<RecordingBuffer>) {
        let buffer = self.log.buffer(name, address, size);
        let tracker = DirtyRangeTracker::with_config(self.context(), buffer.clone(), &self.config);
        (tracker, buffer)
    }

    /// The currently open sync number.
    pub fn current(&self) -> SyncNumber {
        self.timeline.sync_number()
    }

    /// Close the open batch, returning its number.
    pub fn close_batch(&self) -> SyncNumber {
        self.timeline.create_sync()
    }

    /// Close the open batch and retire every closed one.
    pub fn close_and_retire(&self) -> SyncNumber {
        let closed = self.timeline.create_sync();
        self.timeline.signal_all();
        closed
    }
}

/// Dirty entries of `tracker` as `(address, size, sync_number)`.
pub fn entries(tracker: &DirtyRangeTracker) -> Vec<(u64, u64, SyncNumber)> {
    tracker
        .snapshot()
        .iter()
        .map(|range| (range.address, range.size, range.sync_number))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_shared_between_buffers() {
        let log = FlushLog::new();
        let a = log.buffer("a", 0, 16);
        let b = log.buffer("b", 16, 16);

        a.flush(0, 4, 1);
        b.flush(16, 8, 2);
        a.release();

        assert_eq!(log.len(), 2);
        assert_eq!(log.bytes_flushed_by("b"), 8);
        assert_eq!(a.release_count(), 1);
        assert_eq!(log.take()[0].buffer, "a");
        assert!(log.is_empty());
    }

    #[test]
    fn fixture_retires_closed_batches() {
        let fixture = TrackerFixture::starting_at(3);
        assert_eq!(fixture.close_and_retire(), 3);
        assert!(fixture.timeline.is_retired(3));
        assert_eq!(fixture.current(), 4);
    }
}
