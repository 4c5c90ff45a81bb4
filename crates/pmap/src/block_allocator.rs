//! Boot-time physical memory carving.
//!
//! A memblock-style allocator: a sorted list of memory regions and a sorted list of
//! reserved regions, both in fixed storage so it works before any heap exists. Free memory
//! is whatever is in the first list but not the second. Bootstrap carves the hashed page
//! table out of it, and it can keep serving single frames afterwards as a [`FrameSource`].

use alloc::vec::Vec;

use crate::arch::PAGE_SIZE;
use crate::{AllocMode, BootMemoryRegion, FrameSource, PhysicalAddress};

/// Maximum number of memory regions that can be tracked.
const MAX_REGIONS: usize = 64;

/// Errors that can occur during memory allocation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No suitable memory region available for allocation.
    OutOfMemory,
    /// The requested alignment is invalid (e.g., not a power of two).
    InvalidAlignment,
    /// The region arrays are full and cannot track more regions.
    RegionsFull,
    /// The region being released was never reserved.
    RegionOverlap,
}

/// A contiguous range of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    base: PhysicalAddress,
    size: usize,
}

impl MemoryRegion {
    pub const fn new(base: PhysicalAddress, size: usize) -> Self {
        Self { base, size }
    }

    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the end address (exclusive) as a raw value; the last region of a 32-bit
    /// space ends at 4 GiB, which is not itself a valid address.
    pub const fn end(&self) -> usize {
        self.base.as_usize() + self.size
    }

    pub const fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.base.as_usize() < other.end() && other.base.as_usize() < self.end()
    }

    /// Returns true if `[pa, pa + len)` lies entirely inside this region.
    pub const fn contains(&self, pa: PhysicalAddress, len: usize) -> bool {
        pa.as_usize() >= self.base.as_usize() && pa.as_usize() + len <= self.end()
    }
}

/// Sorted, coalesced set of regions in fixed storage.
struct RegionArray {
    regions: [MemoryRegion; MAX_REGIONS],
    count: usize,
}

impl RegionArray {
    const fn new() -> Self {
        Self {
            regions: [MemoryRegion::new(PhysicalAddress::new(0), 0); MAX_REGIONS],
            count: 0,
        }
    }

    fn as_slice(&self) -> &[MemoryRegion] {
        &self.regions[..self.count]
    }

    /// Inserts `[start, end)`, merging with any region it touches.
    fn add(&mut self, mut start: usize, mut end: usize) -> Result<(), AllocError> {
        if start >= end {
            return Ok(());
        }
        let first = self.as_slice().partition_point(|r| r.end() < start);
        let mut last = first;
        while last < self.count && self.regions[last].base().as_usize() <= end {
            start = start.min(self.regions[last].base().as_usize());
            end = end.max(self.regions[last].end());
            last += 1;
        }
        if first == last && self.count == MAX_REGIONS {
            return Err(AllocError::RegionsFull);
        }
        let merged = MemoryRegion::new(PhysicalAddress::new(start), end - start);
        self.splice(first, last, &[merged]);
        Ok(())
    }

    /// Removes `[start, end)`, splitting a region that straddles it.
    fn subtract(&mut self, start: usize, end: usize) -> Result<(), AllocError> {
        if start >= end {
            return Ok(());
        }
        let first = self.as_slice().partition_point(|r| r.end() <= start);
        let mut last = first;
        while last < self.count && self.regions[last].base().as_usize() < end {
            last += 1;
        }
        if first == last {
            return Err(AllocError::RegionOverlap);
        }

        let head = self.regions[first];
        let tail = self.regions[last - 1];
        let mut keep = [MemoryRegion::new(PhysicalAddress::new(0), 0); 2];
        let mut kept = 0;
        if head.base().as_usize() < start {
            keep[kept] = MemoryRegion::new(head.base(), start - head.base().as_usize());
            kept += 1;
        }
        if tail.end() > end {
            keep[kept] = MemoryRegion::new(PhysicalAddress::new(end), tail.end() - end);
            kept += 1;
        }
        if self.count - (last - first) + kept > MAX_REGIONS {
            return Err(AllocError::RegionsFull);
        }
        self.splice(first, last, &keep[..kept]);
        Ok(())
    }

    /// Replaces `regions[from..to]` with `with`.
    fn splice(&mut self, from: usize, to: usize, with: &[MemoryRegion]) {
        let tail = self.count - to;
        let new_to = from + with.len();
        self.regions.copy_within(to..self.count, new_to);
        self.regions[from..new_to].copy_from_slice(with);
        self.count = new_to + tail;
    }

    fn total_size(&self) -> usize {
        self.as_slice().iter().map(MemoryRegion::size).sum()
    }
}

/// Boot-time storage carving, as needed by [`Pmap::bootstrap`](crate::Pmap::bootstrap).
pub trait BootMemory {
    /// Permanently takes `size` bytes aligned to `align` out of boot memory.
    fn steal(&self, size: usize, align: usize) -> Result<PhysicalAddress, AllocError>;

    /// Returns every region of ordinary memory, used to decide cacheability.
    fn memory_regions(&self) -> Vec<MemoryRegion>;
}

/// A block-based physical memory allocator with static accounting space.
///
/// # Thread Safety
///
/// Both lists sit behind `spin::Mutex`es so every operation takes `&self`. Contention
/// should be minimal until secondary processors are launched.
pub struct BlockAllocator {
    memory: spin::Mutex<RegionArray>,
    reserved: spin::Mutex<RegionArray>,
}

impl BlockAllocator {
    /// Creates a new empty block allocator.
    pub const fn new() -> Self {
        Self {
            memory: spin::Mutex::new(RegionArray::new()),
            reserved: spin::Mutex::new(RegionArray::new()),
        }
    }

    /// Creates an allocator covering the usable regions of a boot memory map.
    pub fn from_boot_map<R: BootMemoryRegion>(regions: &[R]) -> Result<Self, AllocError> {
        let allocator = Self::new();
        for region in regions.iter().filter(|r| r.is_usable()) {
            allocator.add(region.base(), region.size())?;
        }
        Ok(allocator)
    }

    /// Adds a usable memory region, shrunk inward to whole pages.
    pub fn add(&self, base: PhysicalAddress, size: usize) -> Result<(), AllocError> {
        let start = base.as_usize().next_multiple_of(PAGE_SIZE);
        let end = (base.as_usize() + size) & !(PAGE_SIZE - 1);
        self.memory.lock().add(start, end)
    }

    /// Reserves a memory region, grown outward to whole pages.
    pub fn reserve(&self, base: PhysicalAddress, size: usize) -> Result<(), AllocError> {
        let start = base.as_usize() & !(PAGE_SIZE - 1);
        let end = (base.as_usize() + size).next_multiple_of(PAGE_SIZE);
        self.reserved.lock().add(start, end)
    }

    /// Allocates physical memory using first fit.
    ///
    /// `size` is rounded up to whole pages; `align` must be a power of two.
    pub fn allocate(&self, size: usize, align: usize) -> Result<PhysicalAddress, AllocError> {
        if size == 0 {
            return Err(AllocError::OutOfMemory);
        }
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment);
        }
        let size = size.next_multiple_of(PAGE_SIZE);
        let align = align.max(PAGE_SIZE);

        let memory = self.memory.lock();
        let mut reserved = self.reserved.lock();

        for region in memory.as_slice() {
            let mut candidate = region.base().as_usize().next_multiple_of(align);
            while candidate + size <= region.end() {
                let wanted = MemoryRegion::new(PhysicalAddress::new(candidate), size);
                match reserved.as_slice().iter().find(|r| r.overlaps(&wanted)) {
                    Some(blocker) => candidate = blocker.end().next_multiple_of(align),
                    None => {
                        reserved.add(candidate, candidate + size)?;
                        return Ok(wanted.base());
                    }
                }
            }
        }

        Err(AllocError::OutOfMemory)
    }

    /// Frees a previously allocated memory region.
    pub fn free(&self, base: PhysicalAddress, size: usize) -> Result<(), AllocError> {
        let start = base.as_usize() & !(PAGE_SIZE - 1);
        let end = (base.as_usize() + size).next_multiple_of(PAGE_SIZE);
        self.reserved.lock().subtract(start, end)
    }

    /// Returns the total amount of physical memory tracked by the allocator.
    pub fn total_memory(&self) -> usize {
        self.memory.lock().total_size()
    }

    /// Returns the total amount of reserved or allocated memory.
    pub fn reserved_memory(&self) -> usize {
        self.reserved.lock().total_size()
    }

    /// Returns the total amount of available (free) memory.
    pub fn available_memory(&self) -> usize {
        self.total_memory().saturating_sub(self.reserved_memory())
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BootMemory for BlockAllocator {
    fn steal(&self, size: usize, align: usize) -> Result<PhysicalAddress, AllocError> {
        self.allocate(size, align)
    }

    fn memory_regions(&self) -> Vec<MemoryRegion> {
        self.memory.lock().as_slice().to_vec()
    }
}

impl FrameSource for BlockAllocator {
    fn alloc_frame(&self, _mode: AllocMode) -> Option<PhysicalAddress> {
        match self.allocate(PAGE_SIZE, PAGE_SIZE) {
            Ok(frame) => Some(frame),
            Err(err) => {
                log::error!("frame allocation failed: {:?}", err);
                None
            }
        }
    }

    fn free_frame(&self, frame: PhysicalAddress) {
        if let Err(err) = self.free(frame, PAGE_SIZE) {
            log::error!("freeing frame {} failed: {:?}", frame, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pa(addr: usize) -> PhysicalAddress {
        PhysicalAddress::new(addr)
    }

    fn bases(array: &RegionArray) -> Vec<(usize, usize)> {
        array.as_slice().iter().map(|r| (r.base().as_usize(), r.size())).collect()
    }

    #[test]
    fn region_array_add_and_merge() {
        let mut array = RegionArray::new();
        array.add(0x2000, 0x3000).unwrap();
        array.add(0x3000, 0x4000).unwrap();
        assert_eq!(bases(&array), vec![(0x2000, 0x2000)]);

        array.add(0x8000, 0x9000).unwrap();
        array.add(0x0, 0x1000).unwrap();
        assert_eq!(
            bases(&array),
            vec![(0x0, 0x1000), (0x2000, 0x2000), (0x8000, 0x1000)]
        );

        // Bridges the first two.
        array.add(0x1000, 0x2000).unwrap();
        assert_eq!(bases(&array), vec![(0x0, 0x4000), (0x8000, 0x1000)]);
    }

    #[test]
    fn region_array_subtract_splits() {
        let mut array = RegionArray::new();
        array.add(0x1000, 0x4000).unwrap();
        array.subtract(0x2000, 0x3000).unwrap();
        assert_eq!(bases(&array), vec![(0x1000, 0x1000), (0x3000, 0x1000)]);
        assert_eq!(array.subtract(0x2000, 0x3000), Err(AllocError::RegionOverlap));
    }

    #[test]
    fn region_array_full() {
        let mut array = RegionArray::new();
        for i in 0..MAX_REGIONS {
            array.add(i * 0x2000, i * 0x2000 + 0x1000).unwrap();
        }
        assert_eq!(
            array.add(MAX_REGIONS * 0x2000, MAX_REGIONS * 0x2000 + 0x1000),
            Err(AllocError::RegionsFull)
        );
    }

    #[test]
    fn allocator_add_rounds_inward_and_reserve_outward() {
        let allocator = BlockAllocator::new();
        allocator.add(pa(0x0800), 0x3000).unwrap();
        assert_eq!(allocator.total_memory(), 0x2000);
        allocator.reserve(pa(0x1800), 0x10).unwrap();
        assert_eq!(allocator.reserved_memory(), 0x1000);
        assert_eq!(allocator.available_memory(), 0x1000);
    }

    #[test]
    fn allocator_alloc_and_free() {
        let allocator = BlockAllocator::new();
        allocator.add(pa(0x0), 0x4000).unwrap();
        let first = allocator.allocate(0x1000, PAGE_SIZE).unwrap();
        let second = allocator.allocate(0x1000, PAGE_SIZE).unwrap();
        assert_ne!(first, second);
        allocator.free(first, 0x1000).unwrap();
        assert_eq!(allocator.allocate(0x1000, PAGE_SIZE).unwrap(), first);
    }

    #[test]
    fn allocator_alignment_skips_reserved_memory() {
        let allocator = BlockAllocator::new();
        allocator.add(pa(0x0), 0x10000).unwrap();
        allocator.reserve(pa(0x0), 0x1000).unwrap();
        let block = allocator.allocate(0x2000, 0x4000).unwrap();
        assert_eq!(block, pa(0x4000));
        assert_eq!(allocator.allocate(0x1000, 3), Err(AllocError::InvalidAlignment));
    }

    #[test]
    fn allocator_out_of_memory() {
        let allocator = BlockAllocator::new();
        allocator.add(pa(0x0), 0x2000).unwrap();
        assert!(allocator.alloc_frame(AllocMode::NonBlocking).is_some());
        assert!(allocator.alloc_frame(AllocMode::NonBlocking).is_some());
        assert!(allocator.alloc_frame(AllocMode::Blocking).is_none());
        assert_eq!(allocator.allocate(0x1000, PAGE_SIZE), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn boot_memory_reports_regions() {
        let allocator = BlockAllocator::new();
        allocator.add(pa(0x0), 0x2000).unwrap();
        allocator.add(pa(0x10000), 0x1000).unwrap();
        let stolen = allocator.steal(0x1000, 0x1000).unwrap();
        assert_eq!(stolen, pa(0x0));
        let regions = allocator.memory_regions();
        assert_eq!(regions.len(), 2);
        assert!(regions[1].contains(pa(0x10000), 0x1000));
    }
}
