//! Traits for items stored in range lists.

use memtrack_core::Range;

/// An item occupying a half-open address interval.
pub trait RangeItem {
    /// Start address.
    fn address(&self) -> u64;

    /// Size in bytes.
    fn size(&self) -> u64;

    /// Exclusive end address.
    #[inline]
    fn end_address(&self) -> u64 {
        self.address().wrapping_add(self.size())
    }

    /// Check whether this item intersects `[address, address + size)`.
    #[inline]
    fn overlaps_with(&self, address: u64, size: u64) -> bool {
        self.address() < address.saturating_add(size) && address < self.end_address()
    }

    /// The item's bounds as a plain range.
    #[inline]
    fn range(&self) -> Range {
        Range::new(self.address(), self.size())
    }
}

/// A range item that can be cut in two.
///
/// Only items stored in a [`NonOverlappingRangeList`](crate::NonOverlappingRangeList)
/// need to implement this.
pub trait SplittableRange: RangeItem + Sized {
    /// Shrink `self` to end at `split_address` and return the remainder
    /// `[split_address, old_end)`, carrying over any payload.
    ///
    /// Callers guarantee `address < split_address < end_address`.
    fn split_off(&mut self, split_address: u64) -> Self;
}

impl RangeItem for Range {
    #[inline]
    fn address(&self) -> u64 {
        self.address
    }

    #[inline]
    fn size(&self) -> u64 {
        self.size
    }
}

impl SplittableRange for Range {
    fn split_off(&mut self, split_address: u64) -> Self {
        let end = self.end_address();
        self.size = split_address - self.address;
        Self::new(split_address, end - split_address)
    }
}
