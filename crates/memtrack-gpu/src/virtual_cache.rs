//! Virtual to physical range cache.
//!
//! Resolving a virtual range walks the page tables, so resolved ranges are
//! cached. Lookups that are not fully covered grow the cached entry to the
//! union of old and new extents. Unmaps invalidate lazily: the handler only
//! queues the range and the next lookup drops overlapping entries.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use memtrack_core::constants::SPARSE_BUFFER_ALIGNMENT;
use memtrack_core::{MultiRange, Range};
use memtrack_range::{NonOverlappingRangeList, RangeItem, SharedRangeList, SplittableRange};

use crate::config::CacheConfig;

/// Resolves virtual ranges to physical sub-ranges.
pub trait PhysicalTranslator: Send + Sync {
    /// Physical sub-ranges backing `[address, address + size)`, in virtual
    /// order. Unmapped holes use [`Range::UNMAPPED_ADDRESS`].
    fn physical_regions(&self, address: u64, size: u64) -> MultiRange;
}

impl<F> PhysicalTranslator for F
where
    F: Fn(u64, u64) -> MultiRange + Send + Sync,
{
    fn physical_regions(&self, address: u64, size: u64) -> MultiRange {
        self(address, size)
    }
}

/// A cached virtual range and its physical backing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualRange {
    pub address: u64,
    pub size: u64,
    pub physical: MultiRange,
}

impl VirtualRange {
    pub const fn new(address: u64, size: u64, physical: MultiRange) -> Self {
        Self {
            address,
            size,
            physical,
        }
    }
}

impl RangeItem for VirtualRange {
    #[inline]
    fn address(&self) -> u64 {
        self.address
    }

    #[inline]
    fn size(&self) -> u64 {
        self.size
    }
}

impl SplittableRange for VirtualRange {
    fn split_off(&mut self, split_address: u64) -> Self {
        let offset = split_address - self.address;
        let rest_size = self.size - offset;
        let rest = self.physical.slice(offset, rest_size);

        self.physical = self.physical.slice(0, offset);
        self.size = offset;
        Self::new(split_address, rest_size, rest)
    }
}

type RemapAction = Box<dyn FnOnce() + Send>;

/// Notification that a guest virtual range was unmapped.
///
/// Listeners register remap actions; the owner of the event runs them once
/// the unmap has been applied.
pub struct UnmapEvent {
    address: u64,
    size: u64,
    remap_actions: Vec<RemapAction>,
}

impl UnmapEvent {
    pub fn new(address: u64, size: u64) -> Self {
        Self {
            address,
            size,
            remap_actions: Vec::new(),
        }
    }

    #[inline]
    pub const fn address(&self) -> u64 {
        self.address
    }

    #[inline]
    pub const fn size(&self) -> u64 {
        self.size
    }

    pub fn add_remap_action<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.remap_actions.push(Box::new(action));
    }

    /// Run and drop every registered remap action.
    pub fn run_remap_actions(&mut self) {
        for action in self.remap_actions.drain(..) {
            action();
        }
    }
}

impl fmt::Debug for UnmapEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnmapEvent")
            .field("address", &self.address)
            .field("size", &self.size)
            .field("remap_actions", &self.remap_actions.len())
            .finish()
    }
}

/// Result of [`VirtualRangeCache::try_get_or_add_range`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeLookup {
    /// A cached entry already covered the query.
    pub found: bool,
    /// Physical backing of the query. Collapsed to a single range when the
    /// sub-ranges are not aligned for sparse mapping.
    pub range: MultiRange,
}

#[derive(Debug, Default)]
struct DeferredUnmaps {
    queue: SegQueue<Range>,
    pending: AtomicBool,
}

/// Cache of resolved virtual ranges for one address space.
pub struct VirtualRangeCache {
    translator: Box<dyn PhysicalTranslator>,
    ranges: SharedRangeList<NonOverlappingRangeList<VirtualRange>>,
    deferred: Arc<DeferredUnmaps>,
    config: CacheConfig,
}

impl VirtualRangeCache {
    pub fn new<T>(translator: T) -> Self
    where
        T: PhysicalTranslator + 'static,
    {
        Self::with_config(translator, CacheConfig::default())
    }

    pub fn with_config<T>(translator: T, mut config: CacheConfig) -> Self
    where
        T: PhysicalTranslator + 'static,
    {
        if !config.sparse_alignment.is_power_of_two() {
            tracing::warn!(
                alignment = config.sparse_alignment,
                fallback = SPARSE_BUFFER_ALIGNMENT,
                "sparse alignment is not a power of two, using the default"
            );
            config.sparse_alignment = SPARSE_BUFFER_ALIGNMENT;
        }
        Self {
            translator: Box::new(translator),
            ranges: SharedRangeList::new(NonOverlappingRangeList::with_capacity(
                config.initial_capacity,
            )),
            deferred: Arc::new(DeferredUnmaps::default()),
            config,
        }
    }

    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.read().is_empty()
    }

    /// Virtual extents of the cached entries in address order.
    pub fn cached_ranges(&self) -> Vec<Range> {
        self.ranges.read().iter().map(RangeItem::range).collect()
    }

    /// Resolve `[address, address + size)`, caching the result.
    #[cfg_attr(feature = "trace-spans", tracing::instrument(level = "trace", skip_all))]
    pub fn try_get_or_add_range(&self, address: u64, size: u64) -> RangeLookup {
        if size == 0 {
            return RangeLookup {
                found: false,
                range: MultiRange::default(),
            };
        }
        self.drain_deferred_unmaps();

        if let Some(range) = covering(&self.ranges.read(), address, size) {
            return self.finish(true, range, size);
        }

        let mut ranges = self.ranges.write();
        // Another thread may have added it between the two locks.
        if let Some(range) = covering(&ranges, address, size) {
            return self.finish(true, range, size);
        }

        let end_address = address.saturating_add(size);
        let (start, end) = ranges
            .overlaps(address, size)
            .iter()
            .fold((address, end_address), |(start, end), existing| {
                (start.min(existing.address), end.max(existing.end_address()))
            });
        let stale = ranges.remove_overlaps(address, size);

        let physical = self.translator.physical_regions(start, end - start);
        let range = physical.slice(address - start, size);
        tracing::trace!(
            address = start,
            size = end - start,
            replaced = stale.len(),
            sub_ranges = physical.count(),
            "cached virtual range"
        );

        if let Err(err) = ranges.add(VirtualRange::new(start, end - start, physical)) {
            tracing::error!(error = %err, "virtual range cache invariant violated");
            panic!("virtual range cache: {err}");
        }
        drop(ranges);

        self.finish(false, range, size)
    }

    /// Queue invalidation of the unmapped range once the unmap is applied.
    pub fn memory_unmapped_handler(&self, event: &mut UnmapEvent) {
        let deferred = Arc::clone(&self.deferred);
        let range = Range::new(event.address(), event.size());
        event.add_remap_action(move || {
            deferred.queue.push(range);
            deferred.pending.store(true, Ordering::Release);
        });
    }

    /// Check whether `range` may be exposed as sparse with this cache's
    /// alignment.
    pub fn is_sparse_aligned(&self, range: &MultiRange) -> bool {
        is_sparse_aligned(range, self.config.sparse_alignment)
    }

    fn drain_deferred_unmaps(&self) {
        if !self.deferred.pending.swap(false, Ordering::AcqRel) {
            return;
        }

        let mut ranges = self.ranges.write();
        while let Some(unmapped) = self.deferred.queue.pop() {
            let removed = ranges.remove_overlaps(unmapped.address, unmapped.size);
            if !removed.is_empty() {
                tracing::trace!(
                    address = unmapped.address,
                    size = unmapped.size,
                    removed = removed.len(),
                    "invalidated cached virtual ranges"
                );
            }
        }
    }

    fn finish(&self, found: bool, range: MultiRange, size: u64) -> RangeLookup {
        if self.is_sparse_aligned(&range) {
            return RangeLookup { found, range };
        }
        let address = range
            .sub_ranges()
            .first()
            .map_or(Range::UNMAPPED_ADDRESS, |first| first.address);
        RangeLookup {
            found,
            range: MultiRange::new(address, size),
        }
    }
}

impl fmt::Debug for VirtualRangeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualRangeCache")
            .field("entries", &self.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn covering(
    ranges: &NonOverlappingRangeList<VirtualRange>,
    address: u64,
    size: u64,
) -> Option<MultiRange> {
    match ranges.overlaps(address, size) {
        [entry] if entry.address <= address && entry.end_address() >= address.saturating_add(size) => {
            Some(entry.physical.slice(address - entry.address, size))
        }
        _ => None,
    }
}

/// Check whether `range` may be mapped sparsely at `alignment` granularity.
///
/// Every sub-range but the first must start aligned (unmapped holes are
/// exempt) and every sub-range but the last must have an aligned size. A
/// single sub-range must start aligned. `alignment` is expected to be a power
/// of two; zero is treated as one.
pub fn is_sparse_aligned(range: &MultiRange, alignment: u64) -> bool {
    let mask = alignment.saturating_sub(1);
    let sub_ranges = range.sub_ranges();
    if let [single] = sub_ranges {
        return single.address & mask == 0;
    }

    let last = sub_ranges.len().saturating_sub(1);
    sub_ranges.iter().enumerate().all(|(index, sub_range)| {
        let address_aligned =
            index == 0 || sub_range.is_unmapped() || sub_range.address & mask == 0;
        let size_aligned = index == last || sub_range.size & mask == 0;
        address_aligned && size_aligned
    })
}
