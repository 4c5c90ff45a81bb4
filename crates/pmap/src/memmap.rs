//! Page records for managed physical memory.
//!
//! The memory map holds one [`Frame`] per page of every usable boot region, in sorted
//! ranges, and answers the reverse lookup the page-table manager uses to decide whether a
//! physical address is managed.
//!
//! # Building a Memory Map
//!
//! Implement [`BootMemoryRegion`] on the firmware's memory map entry type, then call
//! [`MemoryMap::from_boot_map`]:
//!
//! ```ignore
//! struct OpenFirmwareRegion { /* ... */ }
//!
//! impl BootMemoryRegion for OpenFirmwareRegion {
//!     fn base(&self) -> PhysicalAddress { /* ... */ }
//!     fn size(&self) -> usize { /* ... */ }
//!     fn is_usable(&self) -> bool { /* ... */ }
//! }
//!
//! let records = MemoryMap::from_boot_map(&regions);
//! ```

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::{Frame, FrameNumber, PAGE_SIZE, PageRecords, PhysicalAddress};

/// Represents a single entry in a boot-time memory map.
pub trait BootMemoryRegion {
    /// Returns the base physical address of this region.
    fn base(&self) -> PhysicalAddress;

    /// Returns the size of this region in bytes.
    fn size(&self) -> usize;

    /// Returns whether this region contains usable memory.
    ///
    /// Non-usable memory (firmware, device memory, etc.) should return `false`.
    fn is_usable(&self) -> bool;
}

struct FrameRange {
    start: FrameNumber,
    frames: Box<[Frame]>,
}

impl FrameRange {
    fn end(&self) -> FrameNumber {
        self.start + self.frames.len()
    }
}

/// Page records for every usable page reported at boot.
pub struct MemoryMap {
    ranges: Box<[FrameRange]>,
}

impl MemoryMap {
    /// Builds records for every whole page inside the usable regions of `regions`.
    ///
    /// Overlapping usable regions are merged so that each page has exactly one record.
    pub fn from_boot_map<R: BootMemoryRegion>(regions: &[R]) -> Self {
        let mut spans: Vec<(usize, usize)> = regions
            .iter()
            .filter(|region| region.is_usable() && region.size() != 0)
            .map(|region| {
                let start = region.base().as_usize().div_ceil(PAGE_SIZE);
                let end = (region.base().as_usize() + region.size()) / PAGE_SIZE;
                (start, end)
            })
            .filter(|(start, end)| start < end)
            .collect();
        spans.sort_unstable();

        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
        for (start, end) in spans {
            match merged.last_mut() {
                Some((_, last_end)) if start <= *last_end => *last_end = (*last_end).max(end),
                _ => merged.push((start, end)),
            }
        }

        let ranges = merged
            .into_iter()
            .map(|(start, end)| FrameRange {
                start: FrameNumber::new(start),
                frames: (start..end).map(|_| Frame::new()).collect(),
            })
            .collect();

        let map = Self { ranges };
        log::debug!(
            "memory map: {} managed pages in {} ranges",
            map.managed_pages(),
            map.ranges.len()
        );
        map
    }

    /// Returns the number of pages that have a record.
    pub fn managed_pages(&self) -> usize {
        self.ranges.iter().map(|range| range.frames.len()).sum()
    }

    /// Returns the record for the page containing `pa`, if it is managed.
    pub fn frame(&self, pa: PhysicalAddress) -> Option<&Frame> {
        let frame = pa.frame_number();
        let index = self.ranges.partition_point(|range| range.end() <= frame);
        let range = self.ranges.get(index)?;
        if frame < range.start {
            return None;
        }
        range.frames.get(frame - range.start)
    }
}

impl PageRecords for MemoryMap {
    fn record(&self, pa: PhysicalAddress) -> Option<&Frame> {
        self.frame(pa)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct TestRegion {
        pub(crate) base: usize,
        pub(crate) size: usize,
        pub(crate) usable: bool,
    }

    impl BootMemoryRegion for TestRegion {
        fn base(&self) -> PhysicalAddress {
            PhysicalAddress::new(self.base)
        }

        fn size(&self) -> usize {
            self.size
        }

        fn is_usable(&self) -> bool {
            self.usable
        }
    }

    fn region(base: usize, size: usize, usable: bool) -> TestRegion {
        TestRegion { base, size, usable }
    }

    #[test]
    fn records_only_usable_pages() {
        let map = MemoryMap::from_boot_map(&[
            region(0x0, 0x4000, true),
            region(0x4000, 0x4000, false),
            region(0x8000_0000, 0x2000, true),
        ]);
        assert_eq!(map.managed_pages(), 6);
        assert!(map.frame(PhysicalAddress::new(0x3fff)).is_some());
        assert!(map.frame(PhysicalAddress::new(0x4000)).is_none());
        assert!(map.frame(PhysicalAddress::new(0x8000_1000)).is_some());
        assert!(map.frame(PhysicalAddress::new(0x8000_2000)).is_none());
    }

    #[test]
    fn partial_pages_are_not_managed() {
        let map = MemoryMap::from_boot_map(&[region(0x800, 0x2000, true)]);
        assert_eq!(map.managed_pages(), 1);
        assert!(map.frame(PhysicalAddress::new(0x1000)).is_some());
        assert!(map.frame(PhysicalAddress::new(0x0)).is_none());
    }

    #[test]
    fn overlapping_regions_share_records() {
        let map = MemoryMap::from_boot_map(&[
            region(0x2000, 0x3000, true),
            region(0x0, 0x3000, true),
        ]);
        assert_eq!(map.managed_pages(), 5);
        let a = map.frame(PhysicalAddress::new(0x2000)).unwrap() as *const Frame;
        let b = map.record(PhysicalAddress::new(0x2fff)).unwrap() as *const Frame;
        assert_eq!(a, b);
    }
}
