//! Range list that never holds two overlapping items.

use std::ops::Range as IndexRange;

use memtrack_core::{Error, Result};

use crate::item::SplittableRange;
use crate::search;

/// Address-sorted list of mutually disjoint range items.
///
/// With disjoint items both start and end addresses are sorted, so every
/// overlap query resolves to one contiguous index span. Items are addressed
/// by position: an item's neighbours are the entries at `index - 1` and
/// `index + 1`.
#[derive(Debug, Clone)]
pub struct NonOverlappingRangeList<T> {
    items: Vec<T>,
}

impl<T> Default for NonOverlappingRangeList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NonOverlappingRangeList<T> {
    /// Create an empty list.
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Create an empty list with room for `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All items in address order.
    #[inline]
    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    /// Mutable access to an item's payload.
    ///
    /// The caller must not move the item's bounds.
    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)
    }

    #[inline]
    pub fn next(&self, index: usize) -> Option<&T> {
        self.items.get(index + 1)
    }

    #[inline]
    pub fn previous(&self, index: usize) -> Option<&T> {
        index.checked_sub(1).and_then(|i| self.items.get(i))
    }

    /// Remove the item at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn remove_at(&mut self, index: usize) -> T {
        self.items.remove(index)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: SplittableRange> NonOverlappingRangeList<T> {
    /// Insert an item, rejecting it if it overlaps a stored one.
    ///
    /// Returns the index the item landed at.
    pub fn add(&mut self, item: T) -> Result<usize> {
        if item.size() == 0 {
            return Err(Error::EmptyRange(item.address()));
        }
        if let Some(existing) = self.find_overlap(item.address(), item.size()) {
            return Err(overlap_error(&item, existing));
        }
        let index = search::starts_before(&self.items, item.address());
        self.items.insert(index, item);
        Ok(index)
    }

    /// Remove one exact instance of `item`. Returns whether it was found.
    pub fn remove(&mut self, item: &T) -> bool
    where
        T: PartialEq,
    {
        match search::by_address(&self.items, item.address()) {
            Ok(index) if self.items[index] == *item => {
                self.items.remove(index);
                true
            }
            _ => false,
        }
    }

    /// Exact start-address search.
    ///
    /// Returns `Ok(index)` of the item starting at `address`, or
    /// `Err(insertion_point)` if none does.
    pub fn binary_search(&self, address: u64) -> std::result::Result<usize, usize> {
        search::by_address(&self.items, address)
    }

    /// Index of some item overlapping `[address, end_address)`.
    pub fn binary_search_overlap(&self, address: u64, end_address: u64) -> Option<usize> {
        let edges = self.binary_search_edges(address, end_address);
        (!edges.is_empty()).then(|| edges.start + (edges.end - edges.start) / 2)
    }

    /// Index of the left-most item overlapping `[address, end_address)`.
    pub fn binary_search_left_edge(&self, address: u64, end_address: u64) -> Option<usize> {
        let edges = self.binary_search_edges(address, end_address);
        (!edges.is_empty()).then_some(edges.start)
    }

    /// Index of the right-most item overlapping `[address, end_address)`.
    pub fn binary_search_right_edge(&self, address: u64, end_address: u64) -> Option<usize> {
        let edges = self.binary_search_edges(address, end_address);
        (!edges.is_empty()).then(|| edges.end - 1)
    }

    /// Index span `start..end` of exactly the items overlapping
    /// `[address, end_address)`. Empty if nothing overlaps.
    pub fn binary_search_edges(&self, address: u64, end_address: u64) -> IndexRange<usize> {
        if address >= end_address {
            return 0..0;
        }
        let lo = search::ends_after(
            |i| self.items[i].end_address(),
            self.items.len(),
            address,
        );
        let hi = search::starts_before(&self.items, end_address);
        if lo < hi {
            lo..hi
        } else {
            0..0
        }
    }

    /// Any one item overlapping `[address, address + size)`.
    pub fn find_overlap(&self, address: u64, size: u64) -> Option<&T> {
        self.binary_search_overlap(address, address.saturating_add(size))
            .map(|index| &self.items[index])
    }

    /// The contiguous run of items overlapping `[address, address + size)`.
    pub fn overlaps(&self, address: u64, size: u64) -> &[T] {
        let edges = self.binary_search_edges(address, address.saturating_add(size));
        &self.items[edges]
    }

    /// Mutable access to the items overlapping `[address, address + size)`.
    ///
    /// The caller must not move any item's bounds.
    pub fn overlaps_mut(&mut self, address: u64, size: u64) -> &mut [T] {
        let edges = self.binary_search_edges(address, address.saturating_add(size));
        &mut self.items[edges]
    }

    /// Shrink the item at `index` to end at `split_address` and insert the
    /// remainder `[split_address, old_end)` right after it.
    ///
    /// Returns the index of the remainder.
    pub fn split(&mut self, index: usize, split_address: u64) -> Result<usize> {
        let len = self.items.len();
        let item = self
            .items
            .get_mut(index)
            .ok_or(Error::IndexOutOfBounds { index, len })?;

        if split_address <= item.address() || split_address >= item.end_address() {
            return Err(Error::SplitOutOfBounds {
                address: item.address(),
                end_address: item.end_address(),
                split_address,
            });
        }

        let remainder = item.split_off(split_address);
        self.items.insert(index + 1, remainder);
        Ok(index + 1)
    }

    /// Remove every item fully contained in `[address, address + size)`.
    ///
    /// Items straddling either boundary are left untouched; split them first
    /// to remove their inner part.
    pub fn remove_range(&mut self, address: u64, size: u64) -> Vec<T> {
        let end_address = address.saturating_add(size);
        let lo = search::starts_before(&self.items, address);
        let hi = self
            .items
            .partition_point(|item| item.end_address() <= end_address);
        if lo < hi {
            self.items.drain(lo..hi).collect()
        } else {
            Vec::new()
        }
    }

    /// Remove every item overlapping `[address, address + size)`, including
    /// ones straddling the boundaries.
    pub fn remove_overlaps(&mut self, address: u64, size: u64) -> Vec<T> {
        let edges = self.binary_search_edges(address, address.saturating_add(size));
        self.items.drain(edges).collect()
    }

    /// Replace the contiguous run `span` with a single item.
    ///
    /// The item must not overlap the neighbours outside the run.
    /// Returns the index of the new item.
    pub fn replace_span(&mut self, span: IndexRange<usize>, item: T) -> Result<usize> {
        if item.size() == 0 {
            return Err(Error::EmptyRange(item.address()));
        }
        let len = self.items.len();
        if span.start > span.end || span.end > len {
            return Err(Error::IndexOutOfBounds {
                index: span.end,
                len,
            });
        }

        let start = span.start;
        let before = start.checked_sub(1).map(|i| &self.items[i]);
        if let Some(before) = before.filter(|b| b.end_address() > item.address()) {
            return Err(overlap_error(&item, before));
        }
        let after = self.items.get(span.end);
        if let Some(after) = after.filter(|a| item.end_address() > a.address()) {
            return Err(overlap_error(&item, after));
        }

        self.items.splice(span, std::iter::once(item));
        Ok(start)
    }

    /// Return items exactly covering `[address, address + size)`, in address
    /// order.
    ///
    /// Existing items are reused, split at the query bounds when they extend
    /// past them. Gaps are filled with `factory(gap_address, gap_size)`.
    pub fn get_or_add_regions<F>(&mut self, address: u64, size: u64, mut factory: F) -> Result<&mut [T]>
    where
        F: FnMut(u64, u64) -> T,
    {
        if size == 0 {
            return Ok(&mut []);
        }
        let end_address = address
            .checked_add(size)
            .ok_or(Error::Overflow { address, size })?;

        let mut span = self.binary_search_edges(address, end_address);
        let start = if span.is_empty() {
            search::starts_before(&self.items, address)
        } else {
            if self.items[span.start].address() < address {
                span.start = self.split(span.start, address)?;
                span.end += 1;
            }
            let last = span.end - 1;
            if self.items[last].end_address() > end_address {
                self.split(last, end_address)?;
            }
            span.start
        };

        let mut cursor = address;
        let mut index = start;
        let mut created = 0usize;
        while cursor < end_address {
            let next_start = self
                .items
                .get(index)
                .map(|item| item.address())
                .filter(|&next| next < end_address);

            match next_start {
                Some(next) => {
                    if next > cursor {
                        self.items.insert(index, factory(cursor, next - cursor));
                        index += 1;
                        created += 1;
                    }
                    cursor = self.items[index].end_address();
                    index += 1;
                }
                None => {
                    self.items
                        .insert(index, factory(cursor, end_address - cursor));
                    index += 1;
                    created += 1;
                    cursor = end_address;
                }
            }
        }

        if created > 0 {
            tracing::trace!(address, size, created, "filled range list gaps");
        }
        debug_assert!(self.check_invariants().is_ok());
        Ok(&mut self.items[start..index])
    }

    /// Verify that items are non-empty, sorted and pairwise disjoint.
    pub fn check_invariants(&self) -> Result<()> {
        for item in &self.items {
            if item.size() == 0 {
                return Err(Error::EmptyRange(item.address()));
            }
        }
        for pair in self.items.windows(2) {
            if pair[0].end_address() > pair[1].address() {
                return Err(overlap_error(&pair[1], &pair[0]));
            }
        }
        Ok(())
    }
}

fn overlap_error<T: SplittableRange>(item: &T, existing: &T) -> Error {
    Error::Overlap {
        address: item.address(),
        size: item.size(),
        existing_address: existing.address(),
        existing_size: existing.size(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtrack_core::Range;

    fn list_of(ranges: &[(u64, u64)]) -> NonOverlappingRangeList<Range> {
        let mut list = NonOverlappingRangeList::new();
        for &(address, size) in ranges {
            list.add(Range::new(address, size)).unwrap();
        }
        list
    }

    fn bounds(list: &NonOverlappingRangeList<Range>) -> Vec<(u64, u64)> {
        list.iter().map(|r| (r.address, r.end_address())).collect()
    }

    #[test]
    fn add_rejects_overlap() {
        let mut list = list_of(&[(10, 10)]);
        let err = list.add(Range::new(15, 10)).unwrap_err();
        assert!(matches!(err, Error::Overlap { existing_address: 10, .. }));
        assert_eq!(list.add(Range::new(20, 5)), Ok(1));
        assert_eq!(list.add(Range::new(0, 10)), Ok(0));
        assert!(list.add(Range::new(30, 0)).is_err());
    }

    #[test]
    fn edges_cover_exact_overlaps() {
        let list = list_of(&[(0, 10), (10, 10), (30, 10), (50, 10)]);
        assert_eq!(list.binary_search_edges(5, 35), 0..3);
        assert_eq!(list.binary_search_left_edge(20, 30), None);
        assert_eq!(list.binary_search_right_edge(0, 100), Some(3));
        assert_eq!(list.overlaps(12, 40).len(), 2);
        assert!(list.find_overlap(40, 10).is_none());
    }

    #[test]
    fn split_inserts_remainder() {
        let mut list = list_of(&[(0, 20)]);
        assert_eq!(list.split(0, 10), Ok(1));
        assert_eq!(bounds(&list), vec![(0, 10), (10, 20)]);

        assert!(matches!(
            list.split(0, 10),
            Err(Error::SplitOutOfBounds { .. })
        ));
        assert!(matches!(
            list.split(5, 1),
            Err(Error::IndexOutOfBounds { index: 5, len: 2 })
        ));
    }

    #[test]
    fn remove_range_only_takes_contained_items() {
        let mut list = list_of(&[(0, 10), (10, 10), (20, 10), (30, 10)]);
        let removed = list.remove_range(5, 30);
        assert_eq!(removed, vec![Range::new(10, 10), Range::new(20, 10)]);
        assert_eq!(bounds(&list), vec![(0, 10), (30, 40)]);
        assert!(list.remove_range(100, 10).is_empty());
    }

    #[test]
    fn remove_overlaps_takes_straddling_items() {
        let mut list = list_of(&[(0, 10), (10, 10), (20, 10), (40, 10)]);
        let removed = list.remove_overlaps(5, 20);
        assert_eq!(removed.len(), 3);
        assert_eq!(bounds(&list), vec![(40, 50)]);
    }

    #[test]
    fn replace_span_checks_neighbours() {
        let mut list = list_of(&[(0, 10), (10, 5), (15, 5), (30, 10)]);
        assert_eq!(list.replace_span(1..3, Range::new(10, 15)), Ok(1));
        assert_eq!(bounds(&list), vec![(0, 10), (10, 25), (30, 40)]);

        assert!(list.replace_span(1..2, Range::new(5, 10)).is_err());
        assert_eq!(bounds(&list), vec![(0, 10), (10, 25), (30, 40)]);
    }

    #[test]
    fn get_or_add_fills_gaps_and_splits_edges() {
        let mut list = list_of(&[(0, 20), (30, 10), (60, 20)]);

        let covering: Vec<(u64, u64)> = list
            .get_or_add_regions(10, 60, Range::new)
            .unwrap()
            .iter()
            .map(|r| (r.address, r.end_address()))
            .collect();

        assert_eq!(
            covering,
            vec![(10, 20), (20, 30), (30, 40), (40, 60), (60, 70)]
        );
        assert_eq!(
            bounds(&list),
            vec![(0, 10), (10, 20), (20, 30), (30, 40), (40, 60), (60, 70), (70, 80)]
        );
        assert!(list.check_invariants().is_ok());
    }

    #[test]
    fn get_or_add_on_empty_list_creates_one_item() {
        let mut list = NonOverlappingRangeList::new();
        let mut calls = 0;
        let covering = list
            .get_or_add_regions(100, 50, |address, size| {
                calls += 1;
                Range::new(address, size)
            })
            .unwrap()
            .to_vec();
        assert_eq!(covering, vec![Range::new(100, 50)]);
        assert_eq!(calls, 1);
    }

    #[test]
    fn get_or_add_inside_one_item_splits_twice() {
        let mut list = list_of(&[(0, 100)]);
        let covering = list
            .get_or_add_regions(40, 20, Range::new)
            .unwrap()
            .to_vec();
        assert_eq!(covering, vec![Range::new(40, 20)]);
        assert_eq!(bounds(&list), vec![(0, 40), (40, 60), (60, 100)]);
    }

    #[test]
    fn random_mutations_preserve_invariants() {
        // Small deterministic LCG keeps the test reproducible.
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = move || {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            state >> 33
        };

        let mut list = NonOverlappingRangeList::new();
        for _ in 0..500 {
            let address = next() % 1000;
            let size = next() % 64 + 1;
            match next() % 3 {
                0 => {
                    list.get_or_add_regions(address, size, Range::new).unwrap();
                }
                1 => {
                    list.remove_range(address, size);
                }
                _ => {
                    if let Some(index) = list.binary_search_overlap(address, address + size) {
                        let item = list.items()[index];
                        let mid = item.address + item.size / 2;
                        if mid > item.address {
                            list.split(index, mid).unwrap();
                        }
                    }
                }
            }
            assert!(list.check_invariants().is_ok());
        }
    }
}
