//! Sync number ordering.
//!
//! Sync numbers mark GPU completion epochs. They only ever grow, but are
//! compared through a wrapping signed difference so ordering survives the
//! counter wrapping around.

/// Monotonic GPU completion epoch.
pub type SyncNumber = u64;

/// Signed distance from `b` to `a`.
#[inline]
pub const fn sync_diff(a: SyncNumber, b: SyncNumber) -> i64 {
    a.wrapping_sub(b) as i64
}

/// Check whether `a` was issued strictly before `b`.
#[inline]
pub const fn is_before(a: SyncNumber, b: SyncNumber) -> bool {
    sync_diff(a, b) < 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_survives_wraparound() {
        assert!(is_before(u64::MAX, 0));
        assert!(!is_before(0, u64::MAX));
        assert_eq!(sync_diff(3, 5), -2);
        assert_eq!(sync_diff(5, 5), 0);
    }
}
