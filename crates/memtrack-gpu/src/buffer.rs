//! Buffer storage seen by the tracking layer.

use std::fmt;

use memtrack_core::{Range, SyncNumber};

/// Storage backing a tracked GPU buffer.
///
/// The tracker calls [`flush`](Self::flush) to copy GPU-written data for a
/// range back to the guest-visible copy once the given sync number has
/// retired. Migrations hold on to old storage until they retire and call
/// [`release`](Self::release) when they let go of it.
pub trait TrackedBuffer: Send + Sync {
    /// Guest address range covered by this storage.
    fn range(&self) -> Range;

    /// Copy `[address, address + size)` back to guest memory.
    fn flush(&self, address: u64, size: u64, sync_number: SyncNumber);

    /// Called once a migration no longer needs this storage.
    fn release(&self) {}
}

type FlushFn = dyn Fn(u64, u64, SyncNumber) + Send + Sync;
type ReleaseFn = dyn Fn() + Send + Sync;

/// [`TrackedBuffer`] built from closures.
pub struct CallbackBuffer {
    range: Range,
    flush: Box<FlushFn>,
    release: Option<Box<ReleaseFn>>,
}

impl CallbackBuffer {
    /// Create a buffer whose flushes run `flush`.
    pub fn new<F>(range: Range, flush: F) -> Self
    where
        F: Fn(u64, u64, SyncNumber) + Send + Sync + 'static,
    {
        Self {
            range,
            flush: Box::new(flush),
            release: None,
        }
    }

    /// Run `release` when a migration lets go of this buffer.
    #[must_use]
    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }
}

impl TrackedBuffer for CallbackBuffer {
    fn range(&self) -> Range {
        self.range
    }

    fn flush(&self, address: u64, size: u64, sync_number: SyncNumber) {
        (self.flush)(address, size, sync_number);
    }

    fn release(&self) {
        if let Some(release) = &self.release {
            release();
        }
    }
}

impl fmt::Debug for CallbackBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackBuffer")
            .field("range", &self.range)
            .field("has_release", &self.release.is_some())
            .finish_non_exhaustive()
    }
}
