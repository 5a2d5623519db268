//! GPU buffer memory coherency for the memtrack layer.
//!
//! This crate provides:
//! - Dirty range tracking per buffer with sync-number versioning
//! - Flushing of completed GPU writes back to guest memory
//! - Buffer migrations that keep replaced storage flushable
//! - A virtual to physical range cache with deferred invalidation
//! - An in-process sync timeline implementing the sync context

pub mod buffer;
pub mod config;
pub mod context;
pub mod migration;
pub mod modified;
pub mod tracker;
pub mod virtual_cache;

pub use buffer::{CallbackBuffer, TrackedBuffer};
pub use config::{CacheConfig, TrackerConfig};
pub use context::{SyncContext, SyncTimeline};
pub use migration::{BufferMigration, MigrationSpan};
pub use modified::{ModifiedRange, TrackerId};
pub use tracker::DirtyRangeTracker;
pub use virtual_cache::{
    is_sparse_aligned, PhysicalTranslator, RangeLookup, UnmapEvent, VirtualRange,
    VirtualRangeCache,
};
