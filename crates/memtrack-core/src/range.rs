//! Address ranges used by the range lists and the virtual range cache.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Half-open address interval `[address, address + size)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub address: u64,
    pub size: u64,
}

/// A physical sub-range of a [`MultiRange`].
pub type MemoryRange = Range;

impl Range {
    /// Address marking a sub-range with no physical backing.
    pub const UNMAPPED_ADDRESS: u64 = u64::MAX;

    /// Create a new range
    #[inline]
    pub const fn new(address: u64, size: u64) -> Self {
        Self { address, size }
    }

    /// Create a range whose end saturates at the top of the address space.
    #[inline]
    pub const fn clamped(address: u64, size: u64) -> Self {
        Self::new(address, address.saturating_add(size) - address)
    }

    /// Create a range, rejecting empty and overflowing ones.
    pub fn checked(address: u64, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::EmptyRange(address));
        }
        if address.checked_add(size).is_none() {
            return Err(Error::Overflow { address, size });
        }
        Ok(Self { address, size })
    }

    /// Range of an unmapped hole of the given size.
    #[inline]
    pub const fn unmapped(size: u64) -> Self {
        Self::new(Self::UNMAPPED_ADDRESS, size)
    }

    /// Exclusive end address
    #[inline]
    pub const fn end_address(self) -> u64 {
        self.address.wrapping_add(self.size)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.size == 0
    }

    #[inline]
    pub const fn is_unmapped(self) -> bool {
        self.address == Self::UNMAPPED_ADDRESS
    }

    /// Check whether `[address, address + size)` intersects this range.
    #[inline]
    pub const fn overlaps(self, address: u64, size: u64) -> bool {
        self.address < address.wrapping_add(size) && address < self.end_address()
    }

    /// Check whether `[address, address + size)` lies entirely inside this range.
    #[inline]
    pub const fn contains(self, address: u64, size: u64) -> bool {
        self.address <= address && address.wrapping_add(size) <= self.end_address()
    }

    /// Intersection with another range, if non-empty.
    pub fn intersection(self, other: Self) -> Option<Self> {
        let start = self.address.max(other.address);
        let end = self.end_address().min(other.end_address());
        (start < end).then(|| Self::new(start, end - start))
    }
}

/// Ordered list of physical sub-ranges backing one contiguous virtual range.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultiRange {
    ranges: Vec<MemoryRange>,
}

impl MultiRange {
    /// Create a multi-range with a single contiguous sub-range.
    pub fn new(address: u64, size: u64) -> Self {
        Self {
            ranges: vec![MemoryRange::new(address, size)],
        }
    }

    /// Create a multi-range from sub-ranges in virtual order.
    pub fn from_ranges(ranges: Vec<MemoryRange>) -> Self {
        Self { ranges }
    }

    /// Number of sub-ranges.
    #[inline]
    pub fn count(&self) -> usize {
        self.ranges.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Get the sub-range at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn sub_range(&self, index: usize) -> MemoryRange {
        self.ranges[index]
    }

    /// All sub-ranges in order.
    #[inline]
    pub fn sub_ranges(&self) -> &[MemoryRange] {
        &self.ranges
    }

    /// Sum of the sizes of all sub-ranges.
    pub fn total_size(&self) -> u64 {
        self.ranges.iter().map(|r| r.size).sum()
    }

    /// Extract the part covering `[offset, offset + size)` of the virtual span.
    ///
    /// Unmapped holes stay unmapped in the result.
    pub fn slice(&self, offset: u64, size: u64) -> Self {
        let mut skip = offset;
        let mut remaining = size;
        let mut out = Vec::new();

        for range in &self.ranges {
            if remaining == 0 {
                break;
            }
            if skip >= range.size {
                skip -= range.size;
                continue;
            }

            let len = (range.size - skip).min(remaining);
            let address = if range.is_unmapped() {
                MemoryRange::UNMAPPED_ADDRESS
            } else {
                range.address + skip
            };
            out.push(MemoryRange::new(address, len));

            remaining -= len;
            skip = 0;
        }

        Self { ranges: out }
    }
}

impl From<MemoryRange> for MultiRange {
    fn from(range: MemoryRange) -> Self {
        Self {
            ranges: vec![range],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_is_half_open() {
        let range = Range::new(10, 10);
        assert!(range.overlaps(19, 1));
        assert!(!range.overlaps(20, 5));
        assert!(!range.overlaps(5, 5));
        assert!(range.overlaps(0, 100));
    }

    #[test]
    fn checked_rejects_empty_and_overflow() {
        assert_eq!(Range::checked(4, 0), Err(Error::EmptyRange(4)));
        assert!(matches!(
            Range::checked(u64::MAX - 1, 4),
            Err(Error::Overflow { .. })
        ));
        assert_eq!(Range::checked(0, 8), Ok(Range::new(0, 8)));
    }

    #[test]
    fn clamped_range_stops_at_address_space_end() {
        let range = Range::clamped(u64::MAX - 16, 32);
        assert_eq!(range, Range::new(u64::MAX - 16, 16));
        assert_eq!(range.end_address(), u64::MAX);
        assert_eq!(Range::clamped(8, 4), Range::new(8, 4));

        let stored = Range::new(u64::MAX - 16, 8);
        assert_eq!(stored.intersection(range), Some(stored));
    }

    #[test]
    fn intersection_clips() {
        let a = Range::new(0, 20);
        assert_eq!(a.intersection(Range::new(15, 10)), Some(Range::new(15, 5)));
        assert_eq!(a.intersection(Range::new(20, 10)), None);
    }

    #[test]
    fn slice_spans_sub_ranges() {
        let multi = MultiRange::from_ranges(vec![
            MemoryRange::new(0x1000, 0x100),
            MemoryRange::unmapped(0x100),
            MemoryRange::new(0x8000, 0x100),
        ]);

        let slice = multi.slice(0x80, 0x200);
        assert_eq!(
            slice.sub_ranges(),
            &[
                MemoryRange::new(0x1080, 0x80),
                MemoryRange::unmapped(0x100),
                MemoryRange::new(0x8000, 0x80),
            ]
        );
        assert_eq!(slice.total_size(), 0x200);
    }

    #[test]
    fn slice_inside_single_range() {
        let multi = MultiRange::new(0x4000, 0x1000);
        let slice = multi.slice(0x10, 0x20);
        assert_eq!(slice, MultiRange::new(0x4010, 0x20));
    }
}
