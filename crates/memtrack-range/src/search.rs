//! Binary searches shared by both list flavours.
//!
//! Both lists are sorted by start address. Overlap searches need a second
//! monotonic key for the left edge: the end address itself for disjoint
//! lists, a running maximum of end addresses for overlap-tolerant ones.

use crate::item::RangeItem;

/// Exact start-address search. Among equal keys the first match is returned.
pub(crate) fn by_address<T: RangeItem>(items: &[T], address: u64) -> Result<usize, usize> {
    let index = items.partition_point(|item| item.address() < address);
    match items.get(index) {
        Some(item) if item.address() == address => Ok(index),
        _ => Err(index),
    }
}

/// One past the last item starting before `end`.
#[inline]
pub(crate) fn starts_before<T: RangeItem>(items: &[T], end: u64) -> usize {
    items.partition_point(|item| item.address() < end)
}

/// First index whose monotonic end key passes `address`.
#[inline]
pub(crate) fn ends_after(end_keys: impl Fn(usize) -> u64, len: usize, address: u64) -> usize {
    let (mut lo, mut hi) = (0, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if end_keys(mid) <= address {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}
