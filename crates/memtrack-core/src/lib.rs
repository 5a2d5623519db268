//! Core types for the memtrack GPU memory coherency layer.
//!
//! This crate provides the foundational types used throughout the workspace:
//! - Half-open address ranges and physical multi-ranges
//! - Sync number ordering helpers
//! - Common error types

pub mod error;
pub mod range;
pub mod sync;

pub use error::{Error, Result};
pub use range::{MemoryRange, MultiRange, Range};
pub use sync::{sync_diff, SyncNumber};

/// Workspace-wide constants
pub mod constants {
    /// Alignment required for a resolved multi-range to be exposed as sparse (64 KiB).
    pub const SPARSE_BUFFER_ALIGNMENT: u64 = 0x10000;
    /// Initial backing capacity of a per-buffer modified range list.
    pub const MODIFIED_LIST_INITIAL_CAPACITY: usize = 8;
    /// Initial backing capacity of the virtual range cache.
    pub const VIRTUAL_CACHE_INITIAL_CAPACITY: usize = 64;
}
