//! Overlap-tolerant sorted range list.

use std::ops::Range as IndexRange;

use crate::item::RangeItem;
use crate::search;

/// Address-sorted list of range items that may overlap each other.
///
/// Items are kept in ascending start order. Because ends are not sorted when
/// items overlap, the list also keeps a running maximum of end addresses so
/// the left edge of an overlap query stays a binary search.
#[derive(Debug, Clone)]
pub struct SortedRangeList<T> {
    items: Vec<T>,
    /// `max_ends[i]` is the largest end address among `items[..=i]`.
    max_ends: Vec<u64>,
}

impl<T> Default for SortedRangeList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SortedRangeList<T> {
    /// Create an empty list.
    pub const fn new() -> Self {
        Self {
            items: Vec::new(),
            max_ends: Vec::new(),
        }
    }

    /// Create an empty list with room for `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            max_ends: Vec::with_capacity(capacity),
        }
    }

    /// Number of stored items.
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

    /// Item following `index` in address order.
    #[inline]
    pub fn next(&self, index: usize) -> Option<&T> {
        self.items.get(index + 1)
    }

    /// Item preceding `index` in address order.
    #[inline]
    pub fn previous(&self, index: usize) -> Option<&T> {
        index.checked_sub(1).and_then(|i| self.items.get(i))
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.max_ends.clear();
    }
}

impl<T: RangeItem> SortedRangeList<T> {
    /// Insert an item, keeping ascending start order.
    ///
    /// Items with equal start addresses keep their insertion order.
    /// Returns the index the item landed at.
    pub fn add(&mut self, item: T) -> usize {
        let index = self
            .items
            .partition_point(|existing| existing.address() <= item.address());
        self.items.insert(index, item);
        self.max_ends.insert(index, 0);
        self.rebuild_max_ends(index);
        index
    }

    /// Remove the item at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn remove_at(&mut self, index: usize) -> T {
        let item = self.items.remove(index);
        self.max_ends.remove(index);
        self.rebuild_max_ends(index);
        item
    }

    /// Remove one exact instance of `item`. Returns whether it was found.
    pub fn remove(&mut self, item: &T) -> bool
    where
        T: PartialEq,
    {
        let Ok(first) = search::by_address(&self.items, item.address()) else {
            return false;
        };

        let found = self.items[first..]
            .iter()
            .take_while(|existing| existing.address() == item.address())
            .position(|existing| existing == item);

        match found {
            Some(offset) => {
                self.remove_at(first + offset);
                true
            }
            None => false,
        }
    }

    /// Exact start-address search.
    ///
    /// Returns `Ok(index)` of the first item starting at `address`, or
    /// `Err(insertion_point)` if none does.
    pub fn binary_search(&self, address: u64) -> Result<usize, usize> {
        search::by_address(&self.items, address)
    }

    /// Index of some item overlapping `[address, end_address)`.
    pub fn binary_search_overlap(&self, address: u64, end_address: u64) -> Option<usize> {
        self.binary_search_left_edge(address, end_address)
    }

    /// Index of the left-most item overlapping `[address, end_address)`.
    pub fn binary_search_left_edge(&self, address: u64, end_address: u64) -> Option<usize> {
        if address >= end_address {
            return None;
        }
        let lo = search::ends_after(|i| self.max_ends[i], self.items.len(), address);
        (lo < search::starts_before(&self.items, end_address)).then_some(lo)
    }

    /// Index of the right-most item overlapping `[address, end_address)`.
    pub fn binary_search_right_edge(&self, address: u64, end_address: u64) -> Option<usize> {
        let lo = self.binary_search_left_edge(address, end_address)?;
        let hi = search::starts_before(&self.items, end_address);

        // Everything in lo..hi starts before the query end; the right-most one
        // that also ends after the query start is the edge. `lo` always does.
        (lo..hi)
            .rev()
            .find(|&i| self.items[i].end_address() > address)
    }

    /// Index span `start..end` enclosing every item overlapping
    /// `[address, end_address)`. Empty if nothing overlaps.
    ///
    /// Items inside the span that do not overlap the query may exist when
    /// stored ranges overlap each other.
    pub fn binary_search_edges(&self, address: u64, end_address: u64) -> IndexRange<usize> {
        match (
            self.binary_search_left_edge(address, end_address),
            self.binary_search_right_edge(address, end_address),
        ) {
            (Some(left), Some(right)) => left..right + 1,
            _ => 0..0,
        }
    }

    /// Any one item overlapping `[address, address + size)`.
    pub fn find_overlap(&self, address: u64, size: u64) -> Option<&T> {
        self.binary_search_overlap(address, address.saturating_add(size))
            .map(|index| &self.items[index])
    }

    /// All items overlapping `[address, address + size)`, in address order.
    pub fn find_overlaps(&self, address: u64, size: u64) -> Vec<&T> {
        let edges = self.binary_search_edges(address, address.saturating_add(size));
        self.items[edges]
            .iter()
            .filter(|item| item.overlaps_with(address, size))
            .collect()
    }

    fn rebuild_max_ends(&mut self, from: usize) {
        let mut running = from
            .checked_sub(1)
            .map_or(0, |previous| self.max_ends[previous]);
        for (item, max_end) in self.items[from..]
            .iter()
            .zip(self.max_ends[from..].iter_mut())
        {
            running = running.max(item.end_address());
            *max_end = running;
        }
    }
}
