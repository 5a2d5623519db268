//! Tuning knobs for trackers and caches.

use memtrack_core::constants::{
    MODIFIED_LIST_INITIAL_CAPACITY, SPARSE_BUFFER_ALIGNMENT, VIRTUAL_CACHE_INITIAL_CAPACITY,
};
use serde::{Deserialize, Serialize};

/// Dirty range tracker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Initial capacity of the modified range list.
    pub initial_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            initial_capacity: MODIFIED_LIST_INITIAL_CAPACITY,
        }
    }
}

impl TrackerConfig {
    /// Set the initial list capacity.
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }
}

/// Virtual range cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Granularity inner sub-ranges must be aligned to before a resolved
    /// range is exposed as sparse. Must be a power of two.
    pub sparse_alignment: u64,
    /// Initial capacity of the cached range list.
    pub initial_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sparse_alignment: SPARSE_BUFFER_ALIGNMENT,
            initial_capacity: VIRTUAL_CACHE_INITIAL_CAPACITY,
        }
    }
}

impl CacheConfig {
    /// Set the sparse alignment granularity.
    ///
    /// # Panics
    /// Panics if `alignment` is not a power of two.
    pub fn with_sparse_alignment(mut self, alignment: u64) -> Self {
        assert!(
            alignment.is_power_of_two(),
            "sparse alignment must be a power of two"
        );
        self.sparse_alignment = alignment;
        self
    }

    /// Set the initial list capacity.
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }
}
