//! Sorted interval lists for the memtrack coherency layer.
//!
//! This crate provides:
//! - [`SortedRangeList`]: overlap-tolerant, address-sorted storage with
//!   binary-search overlap queries
//! - [`NonOverlappingRangeList`]: storage that keeps every item disjoint and
//!   supports splitting, span removal and gap-filling insertion
//! - [`SharedRangeList`]: the reader-writer lock a list is shared behind
//!
//! Lists are plain data. Structural methods expect the caller to hold the
//! owning lock for the whole batch of edits.

pub mod item;
pub mod non_overlapping;
mod search;
pub mod shared;
pub mod sorted;

pub use item::{RangeItem, SplittableRange};
pub use non_overlapping::NonOverlappingRangeList;
pub use shared::SharedRangeList;
pub use sorted::SortedRangeList;
