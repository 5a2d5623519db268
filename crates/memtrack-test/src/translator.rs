//! Scripted virtual to physical translators.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use memtrack_core::{MemoryRange, MultiRange};
use memtrack_gpu::PhysicalTranslator;
use parking_lot::RwLock;

use crate::{HarnessError, Result};

/// Maps every virtual address to `base + address` and counts calls.
#[derive(Debug)]
pub struct OffsetTranslator {
    base: u64,
    calls: AtomicUsize,
}

impl OffsetTranslator {
    pub const fn new(base: u64) -> Self {
        Self {
            base,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of translations performed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

impl PhysicalTranslator for OffsetTranslator {
    fn physical_regions(&self, address: u64, size: u64) -> MultiRange {
        self.calls.fetch_add(1, Ordering::AcqRel);
        MultiRange::new(self.base + address, size)
    }
}

/// Page-granular translator with explicit mappings.
///
/// Unmapped pages resolve to holes. Physically contiguous neighbouring pages
/// are merged into one sub-range.
#[derive(Debug)]
pub struct PagedTranslator {
    page_size: u64,
    pages: RwLock<BTreeMap<u64, u64>>,
    calls: AtomicUsize,
}

impl PagedTranslator {
    pub fn new(page_size: u64) -> Result<Self> {
        if !page_size.is_power_of_two() {
            return Err(HarnessError::PageSize(page_size));
        }
        Ok(Self {
            page_size,
            pages: RwLock::new(BTreeMap::new()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Map `size` bytes at `virtual_address` to `physical_address`.
    pub fn map(&self, virtual_address: u64, physical_address: u64, size: u64) -> Result<()> {
        for address in [virtual_address, physical_address, size] {
            if address & (self.page_size - 1) != 0 {
                return Err(HarnessError::Misaligned {
                    address,
                    page_size: self.page_size,
                });
            }
        }

        let mut pages = self.pages.write();
        for offset in (0..size).step_by(self.page_size_step()) {
            pages.insert(virtual_address + offset, physical_address + offset);
        }
        Ok(())
    }

    /// Remove the mappings of `size` bytes at `virtual_address`.
    pub fn unmap(&self, virtual_address: u64, size: u64) {
        let mut pages = self.pages.write();
        let end = virtual_address.saturating_add(size);
        pages.retain(|&page, _| page < virtual_address || page >= end);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    fn page_size_step(&self) -> usize {
        usize::try_from(self.page_size).unwrap_or(usize::MAX)
    }
}

impl PhysicalTranslator for PagedTranslator {
    fn physical_regions(&self, address: u64, size: u64) -> MultiRange {
        self.calls.fetch_add(1, Ordering::AcqRel);
        let pages = self.pages.read();
        let mask = self.page_size - 1;
        let end = address + size;

        let mut ranges: Vec<MemoryRange> = Vec::new();
        let mut cursor = address;
        while cursor < end {
            let page = cursor & !mask;
            let chunk = (page + self.page_size).min(end) - cursor;
            let physical = pages
                .get(&page)
                .map_or(MemoryRange::UNMAPPED_ADDRESS, |&base| base + (cursor - page));

            match ranges.last_mut() {
                Some(last) if last.is_unmapped() && physical == MemoryRange::UNMAPPED_ADDRESS => {
                    last.size += chunk;
                }
                Some(last) if !last.is_unmapped() && last.end_address() == physical => {
                    last.size += chunk;
                }
                _ => ranges.push(MemoryRange::new(physical, chunk)),
            }
            cursor += chunk;
        }

        MultiRange::from_ranges(ranges)
    }
}
