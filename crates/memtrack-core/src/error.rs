//! Error types for range list operations.

use thiserror::Error;

/// Range-list error type.
///
/// These only surface when a caller breaks a precondition of a structural
/// operation; the tracking layers treat them as fatal invariant violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Inserting the range would overlap an item already stored.
    #[error(
        "range [{address:#x}, +{size:#x}) overlaps stored range [{existing_address:#x}, +{existing_size:#x})"
    )]
    Overlap {
        address: u64,
        size: u64,
        existing_address: u64,
        existing_size: u64,
    },

    /// Split address does not lie strictly inside the item.
    #[error("split address {split_address:#x} outside of range [{address:#x}, {end_address:#x})")]
    SplitOutOfBounds {
        address: u64,
        end_address: u64,
        split_address: u64,
    },

    /// A stored range must have a non-zero size.
    #[error("empty range at {0:#x}")]
    EmptyRange(u64),

    /// Address plus size does not fit in the address space.
    #[error("range at {address:#x} with size {size:#x} overflows the address space")]
    Overflow { address: u64, size: u64 },

    /// Index does not refer to a stored item.
    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
