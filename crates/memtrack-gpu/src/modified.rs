//! Modified range records.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use memtrack_core::SyncNumber;
use memtrack_range::{RangeItem, SplittableRange};
use serde::{Deserialize, Serialize};

/// Identity of a [`DirtyRangeTracker`](crate::DirtyRangeTracker).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackerId(u64);

impl TrackerId {
    /// Allocate a fresh, process-unique id.
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tracker#{}", self.0)
    }
}

/// A range written by the GPU that has not been flushed yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedRange {
    pub address: u64,
    pub size: u64,
    /// Batch the write was recorded in; the data is only guaranteed complete
    /// once this sync number retires.
    pub sync_number: SyncNumber,
    /// Tracker that recorded the write. Kept across inheritance for
    /// diagnostics; flush routing goes by address range instead.
    pub parent: TrackerId,
}

impl ModifiedRange {
    #[inline]
    pub const fn new(address: u64, size: u64, sync_number: SyncNumber, parent: TrackerId) -> Self {
        Self {
            address,
            size,
            sync_number,
            parent,
        }
    }
}

impl RangeItem for ModifiedRange {
    #[inline]
    fn address(&self) -> u64 {
        self.address
    }

    #[inline]
    fn size(&self) -> u64 {
        self.size
    }
}

impl SplittableRange for ModifiedRange {
    fn split_off(&mut self, split_address: u64) -> Self {
        let end = self.end_address();
        self.size = split_address - self.address;
        Self::new(split_address, end - split_address, self.sync_number, self.parent)
    }
}
