//! The page-table manager context.
//!
//! [`Pmap`] owns every piece of shared state (the hashed table, the mapping store, the
//! identifier allocator and the address-space table) behind one lock, and is the only entry
//! point for the machine-independent VM layer. Operations that change mappings run with
//! interrupts disabled and the lock held, so the spill handler can never observe a chain
//! or a table slot mid-update.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::address_space::{SpaceRecord, SpaceTable};
use crate::arch::VSID_CAPACITY;
use crate::mapping::{MappingStore, PageChain, Pvo, PvoFlags, PvoHandle};
use crate::page_table::{PageTable, PteSlot, pteg_count_for};
use crate::port::{HardwareTlbPort, InterruptGuard, ProcessorPort};
use crate::pte::{PTE_BR, PTE_BW, PTE_G, PTE_I, PTE_M, PTE_RPGN, Pte};
use crate::spill::{EvictionPolicy, TimebaseEviction};
use crate::{
    AddressSpace, AllocMode, BootMemory, EnterFlags, FrameSource, KERNEL_SEGMENT, Mapping,
    MemoryRegion, PAGE_SIZE, PageAttribute, PageNumber, PageRecords, PhysicalAddress,
    Protection, SEGMENT_COUNT, SegmentId, SpaceStats, VM_MIN_KERNEL_ADDRESS, VirtualAddress,
    VsidAllocator,
};

/// Errors reported to callers that opted into recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmapError {
    /// No storage was available for a new mapping object.
    OutOfMemory,
}

impl fmt::Display for PmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory for mapping objects"),
        }
    }
}

impl core::error::Error for PmapError {}

/// What [`Pmap::enter`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entered {
    /// The physical page had no other mapping, even if a previous mapping of the same
    /// address was replaced to get here.
    FirstMapping,
    /// A mapping of the same address in the same space was replaced, and the page is mapped
    /// elsewhere too.
    Replaced,
    /// The page was already mapped elsewhere; this mapping was added alongside.
    Added,
}

/// Boot-time configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmapConfig {
    /// Number of groups in the hashed table. Sized from physical memory when `None`.
    pub pteg_count: Option<usize>,
    /// Number of address spaces the identifier allocator can track.
    pub vsid_capacity: usize,
}

impl Default for PmapConfig {
    fn default() -> Self {
        Self {
            pteg_count: None,
            vsid_capacity: VSID_CAPACITY,
        }
    }
}

/// Counters describing the state of the table and the mapping store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PmapStats {
    /// Entries currently valid in the hashed table.
    pub pte_valid: usize,
    /// Mappings whose entry is not in the hashed table.
    pub pte_overflow: usize,
    /// Spills that had to evict another mapping.
    pub pte_replacements: usize,
    /// Calls to the spill handler.
    pub pte_spills: usize,
    /// Live mapping objects.
    pub pvo_entries: usize,
    pub pvo_enter_calls: usize,
    pub pvo_remove_calls: usize,
    /// Unwired mappings dropped to make room when the pool was exhausted.
    pub pvo_reclaimed: usize,
    /// Live address spaces, including the kernel.
    pub address_spaces: usize,
    /// Groups in the hashed table.
    pub pteg_count: usize,
}

/// Histogram of bucket chain lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketDistribution {
    /// `depths[n]` is the number of buckets whose chain holds exactly `n` mappings.
    pub depths: Vec<usize>,
    pub max_depth: usize,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) overflow: usize,
    pub(crate) replacements: usize,
    pub(crate) spills: usize,
    pub(crate) enter_calls: usize,
    pub(crate) remove_calls: usize,
    pub(crate) reclaimed: usize,
}

pub(crate) struct PmapState {
    pub(crate) table: PageTable,
    pub(crate) store: MappingStore,
    pub(crate) spaces: SpaceTable,
    pub(crate) vsids: VsidAllocator,
    pub(crate) memory: Vec<MemoryRegion>,
    pub(crate) counters: Counters,
    /// Bucket where the last reclaim found its victim.
    pub(crate) reclaim_next: usize,
}

/// The state lock, taken with interrupts disabled. Fields drop in order: the lock is
/// released before interrupts are restored.
pub(crate) struct Locked<'a, H: ProcessorPort> {
    state: spin::MutexGuard<'a, PmapState>,
    _interrupts: InterruptGuard<'a, H>,
}

impl<H: ProcessorPort> Deref for Locked<'_, H> {
    type Target = PmapState;

    fn deref(&self) -> &PmapState {
        &self.state
    }
}

impl<H: ProcessorPort> DerefMut for Locked<'_, H> {
    fn deref_mut(&mut self) -> &mut PmapState {
        &mut self.state
    }
}

/// The hashed page-table manager.
///
/// - `H` is the processor: TLB maintenance, segment registers and interrupts.
/// - `F` supplies frames for mapping-object storage.
/// - `R` maps physical addresses to page records and decides which pages are managed.
/// - `E` picks the slot the spill handler evicts.
pub struct Pmap<H, F, R, E = TimebaseEviction> {
    pub(crate) hw: H,
    pub(crate) frames: F,
    pub(crate) records: R,
    pub(crate) eviction: E,
    state: spin::Mutex<PmapState>,
}

impl<H, F, R> Pmap<H, F, R, TimebaseEviction>
where
    H: HardwareTlbPort + ProcessorPort,
    F: FrameSource,
    R: PageRecords,
{
    /// Carves the hashed table out of boot memory, creates the kernel address space,
    /// loads the kernel's identifiers into every segment register and flushes the TLB.
    pub fn bootstrap<B: BootMemory + ?Sized>(
        hw: H,
        boot: &B,
        frames: F,
        records: R,
        config: PmapConfig,
    ) -> Self {
        Self::bootstrap_with_eviction(hw, boot, frames, records, config, TimebaseEviction)
    }
}

impl<H, F, R, E> Pmap<H, F, R, E>
where
    H: HardwareTlbPort + ProcessorPort,
    F: FrameSource,
    R: PageRecords,
    E: EvictionPolicy,
{
    /// Like [`bootstrap`](Pmap::bootstrap), with a custom eviction policy.
    pub fn bootstrap_with_eviction<B: BootMemory + ?Sized>(
        hw: H,
        boot: &B,
        frames: F,
        records: R,
        config: PmapConfig,
        eviction: E,
    ) -> Self {
        let memory = boot.memory_regions();
        let physical_pages = memory.iter().map(MemoryRegion::size).sum::<usize>() / PAGE_SIZE;
        let groups = config
            .pteg_count
            .unwrap_or_else(|| pteg_count_for(physical_pages));
        let table = PageTable::carve(boot, groups);
        let kernel = SpaceRecord::new(SegmentId::KERNEL);

        hw.load_table(table.physical_base(), table.mask());
        for (segment, vsid) in kernel.segments.iter().enumerate() {
            hw.load_segment(segment, *vsid);
        }
        flush_translations(&hw);

        log::info!(
            "pmap: {} groups ({:#x} bytes) at {}, {} pages of memory, {} address spaces",
            groups,
            groups * 64,
            table.physical_base(),
            physical_pages,
            config.vsid_capacity
        );

        let state = PmapState {
            store: MappingStore::new(table.group_count()),
            table,
            spaces: SpaceTable::new(kernel),
            vsids: VsidAllocator::with_capacity(config.vsid_capacity),
            memory,
            counters: Counters::default(),
            reclaim_next: 0,
        };

        Self {
            hw,
            frames,
            records,
            eviction,
            state: spin::Mutex::new(state),
        }
    }

    pub(crate) fn lock(&self) -> Locked<'_, H> {
        let interrupts = InterruptGuard::new(&self.hw);
        Locked {
            state: self.state.lock(),
            _interrupts: interrupts,
        }
    }

    /// The processor port.
    pub fn hardware(&self) -> &H {
        &self.hw
    }

    /// The page records used to decide which pages are managed.
    pub fn page_records(&self) -> &R {
        &self.records
    }

    /// The kernel address space.
    pub const fn kernel(&self) -> AddressSpace {
        AddressSpace::KERNEL
    }

    /// Creates an empty address space with fresh segment identifiers and one reference.
    ///
    /// # Panics
    ///
    /// Panics with "out of segment identifiers" when the identifier space is exhausted.
    pub fn create(&self) -> AddressSpace {
        let mut state = self.lock();
        let entropy = self.hw.timebase() as u32;
        let id = state.vsids.allocate(entropy);
        let space = state.spaces.insert(SpaceRecord::new(id));
        log::debug!("pmap: created {:?} with {:?}", space, id);
        space
    }

    /// Takes another reference to `space`.
    pub fn add_reference(&self, space: AddressSpace) {
        self.lock().spaces.add_reference(space);
    }

    /// Drops a reference to `space`. The last reference removes any mappings left in the
    /// space and releases its identifiers.
    ///
    /// # Panics
    ///
    /// Panics if `space` is the kernel or is not live.
    pub fn destroy(&self, space: AddressSpace) {
        assert!(
            space != AddressSpace::KERNEL,
            "cannot destroy the kernel address space"
        );
        let mut state = self.lock();
        if !state.spaces.release(space) {
            return;
        }

        let left = state.spaces.get(space).stats.resident;
        if left != 0 {
            log::warn!("pmap: destroying {:?} with {} mappings left", space, left);
            let owned: Vec<PvoHandle> = (0..state.store.bucket_count())
                .flat_map(|bucket| state.store.bucket(bucket))
                .filter(|(_, pvo)| pvo.space == space)
                .map(|(handle, _)| handle)
                .collect();
            for handle in owned {
                state.pvo_remove(&self.hw, &self.records, handle);
            }
        }

        let record = state.spaces.remove(space);
        state.vsids.release(record.id);
        log::debug!("pmap: destroyed {:?}", space);
    }

    /// Maps the page at `va` in `space` to the physical page at `pa`.
    ///
    /// Any existing mapping of `va` in `space` is replaced. The entry is installed in the
    /// hashed table if its bucket pair has room; otherwise it is left for the spill handler.
    ///
    /// # Errors
    ///
    /// Returns [`PmapError::OutOfMemory`] if no mapping object can be allocated and `flags`
    /// includes [`EnterFlags::can_fail`].
    ///
    /// # Panics
    ///
    /// Panics on allocation failure without `can_fail`, or if `space` is not live.
    pub fn enter(
        &self,
        space: AddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Protection,
        flags: EnterFlags,
    ) -> Result<Entered, PmapError> {
        let va = va.align_down(PAGE_SIZE);
        let pa = pa.align_down(PAGE_SIZE);
        let record = self.records.record(pa);
        let mut state = self.lock();

        let cacheable = !flags.is_no_cache() && state.is_memory(pa);
        let mut lo = if cacheable { PTE_M } else { PTE_I | PTE_G };
        lo |= if prot.is_writable() { PTE_BW } else { PTE_BR };

        let was_executable = match record {
            Some(frame) if frame.mappings().is_none() => {
                frame.clear(PageAttribute::Executable);
                false
            }
            Some(frame) => frame.test(PageAttribute::Executable),
            None => false,
        };

        let pvo_flags = PvoFlags::empty()
            .with(PvoFlags::WIRED, flags.is_wired())
            .with(PvoFlags::MANAGED, record.is_some())
            .with(PvoFlags::EXECUTABLE, prot.is_executable());
        let chain = match record {
            Some(frame) => PageChain::Managed(frame),
            None => PageChain::Unmanaged,
        };
        let mode = if flags.is_can_fail() {
            AllocMode::NonBlocking
        } else {
            AllocMode::Blocking
        };

        let entered = match state.pvo_enter(
            &self.hw,
            &self.frames,
            &self.records,
            space,
            va,
            pa,
            lo,
            pvo_flags,
            &chain,
            mode,
        ) {
            Ok(entered) => entered,
            Err(err) if flags.is_can_fail() => return Err(err),
            Err(err) => panic!("pmap_enter: {} mapping {} in {:?}", err, va, space),
        };
        if space == AddressSpace::KERNEL {
            state.make_kernel_resident(&self.hw, &self.eviction, va);
        }

        if prot.is_executable() && cacheable && !was_executable {
            self.hw.sync_icache(pa, PAGE_SIZE);
            if let Some(frame) = record {
                frame.test_and_set(PageAttribute::Executable);
            }
        }

        Ok(entered)
    }

    /// Maps a kernel page that is never reclaimed: wired, unmanaged, and without
    /// reference/change tracking.
    ///
    /// # Panics
    ///
    /// Panics if `va` is below the kernel segment or no mapping object can be allocated.
    pub fn kernel_enter(&self, va: VirtualAddress, pa: PhysicalAddress, prot: Protection) {
        assert!(
            va.as_usize() >= VM_MIN_KERNEL_ADDRESS,
            "kernel_enter: {} is below the kernel segment",
            va
        );
        let va = va.align_down(PAGE_SIZE);
        let pa = pa.align_down(PAGE_SIZE);
        let mut state = self.lock();

        let cacheable = state.is_memory(pa);
        let mut lo = if cacheable { PTE_M } else { PTE_I | PTE_G };
        lo |= if prot.is_writable() { PTE_BW } else { PTE_BR };
        let pvo_flags = PvoFlags::empty()
            .with(PvoFlags::WIRED, true)
            .with(PvoFlags::EXECUTABLE, prot.is_executable());

        if let Err(err) = state.pvo_enter(
            &self.hw,
            &self.frames,
            &self.records,
            AddressSpace::KERNEL,
            va,
            pa,
            lo,
            pvo_flags,
            &PageChain::Unmanaged,
            AllocMode::NonBlocking,
        ) {
            panic!("kernel_enter: {} mapping {} to {}", err, va, pa);
        }
        state.make_kernel_resident(&self.hw, &self.eviction, va);

        if prot.is_executable() && cacheable {
            self.hw.sync_icache(pa, PAGE_SIZE);
        }
    }

    /// Removes the kernel mappings covering `[va, va + len)`.
    pub fn kernel_remove(&self, va: VirtualAddress, len: usize) {
        self.remove(AddressSpace::KERNEL, va, va + len);
    }

    /// Removes every mapping of `space` in `[start, end)`. Pages with no mapping are skipped.
    pub fn remove(&self, space: AddressSpace, start: VirtualAddress, end: VirtualAddress) {
        let mut state = self.lock();
        for page in PageNumber::range(start, end) {
            if let Some(handle) = state.lookup(space, page.start()) {
                state.pvo_remove(&self.hw, &self.records, handle);
            }
        }
    }

    /// Translates `va` in `space`, including the byte offset.
    pub fn extract(&self, space: AddressSpace, va: VirtualAddress) -> Option<PhysicalAddress> {
        let state = self.lock();
        let handle = state.lookup(space, va)?;
        let pte = state.store.get(handle).pte;
        Some(PhysicalAddress::new(
            (pte.lo() & PTE_RPGN) as usize | va.page_offset(),
        ))
    }

    /// Returns a snapshot of the mapping of `va` in `space`, with reference/change bits
    /// brought up to date from the hardware table.
    pub fn find(&self, space: AddressSpace, va: VirtualAddress) -> Option<Mapping> {
        let mut state = self.lock();
        let handle = state.lookup(space, va)?;
        state.synchronize(handle);
        Some(Mapping::from_pvo(state.store.get(handle)))
    }

    /// Calls `f` with a snapshot of every mapping of the physical page containing `pa`.
    pub fn for_each_mapping(&self, pa: PhysicalAddress, mut f: impl FnMut(&Mapping)) {
        let state = self.lock();
        let chain = match self.records.record(pa) {
            Some(frame) => PageChain::Managed(frame),
            None => PageChain::Unmanaged,
        };
        let pa = pa.align_down(PAGE_SIZE);
        for (_, pvo) in state.store.page(&chain) {
            if pvo.physical_address() == pa {
                f(&Mapping::from_pvo(pvo));
            }
        }
    }

    /// Collects every mapping of the physical page containing `pa`.
    pub fn mappings_of(&self, pa: PhysicalAddress) -> Vec<Mapping> {
        let mut mappings = Vec::new();
        self.for_each_mapping(pa, |mapping| mappings.push(*mapping));
        mappings
    }

    /// Clears the wired flag of the mapping of `va` in `space`, if there is one.
    pub fn unwire(&self, space: AddressSpace, va: VirtualAddress) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(handle) = state.lookup(space, va) else {
            return;
        };
        let pvo = state.store.get_mut(handle);
        if pvo.is_wired() {
            pvo.flags.set(PvoFlags::WIRED, false);
            state.spaces.get_mut(space).stats.wired -= 1;
        }
    }

    /// Loads the segment registers with `space`'s identifiers. The kernel segment always
    /// keeps the kernel's identifier.
    pub fn activate(&self, space: AddressSpace) {
        let state = self.lock();
        let record = state.spaces.get(space);
        for segment in (0..SEGMENT_COUNT).filter(|&segment| segment != KERNEL_SEGMENT) {
            self.hw.load_segment(segment, record.vsid(segment));
        }
        log::trace!("pmap: activated {:?}", space);
    }

    /// Nothing to do: the next [`activate`](Self::activate) overwrites every user segment.
    pub fn deactivate(&self, space: AddressSpace) {
        log::trace!("pmap: deactivated {:?}", space);
    }

    /// Waits for every queued invalidation to complete on all processors.
    pub fn update(&self) {
        self.hw.sync_global();
    }

    pub fn statistics(&self) -> PmapStats {
        let state = self.lock();
        PmapStats {
            pte_valid: state.table.valid_count(),
            pte_overflow: state.counters.overflow,
            pte_replacements: state.counters.replacements,
            pte_spills: state.counters.spills,
            pvo_entries: state.store.len(),
            pvo_enter_calls: state.counters.enter_calls,
            pvo_remove_calls: state.counters.remove_calls,
            pvo_reclaimed: state.counters.reclaimed,
            address_spaces: state.spaces.len(),
            pteg_count: state.table.group_count(),
        }
    }

    pub fn space_statistics(&self, space: AddressSpace) -> SpaceStats {
        self.lock().spaces.get(space).stats
    }

    /// Measures how evenly mappings are spread over the hash buckets.
    pub fn bucket_depths(&self) -> BucketDistribution {
        let state = self.lock();
        let lengths: Vec<usize> = (0..state.store.bucket_count())
            .map(|bucket| state.store.bucket(bucket).count())
            .collect();
        let max_depth = lengths.iter().copied().max().unwrap_or(0);
        let mut depths = vec![0; max_depth + 1];
        for length in lengths {
            depths[length] += 1;
        }
        log::debug!("pmap: bucket depths {:?} (max {})", depths, max_depth);
        BucketDistribution { depths, max_depth }
    }

    /// Checks every structural invariant of the table and the mapping store.
    ///
    /// # Panics
    ///
    /// Panics with a message starting with `pvo_verify:` or `pvo_check:` describing the
    /// first violation found.
    pub fn verify(&self) {
        self.lock().verify(&self.records);
    }

    /// Simulates the MMU accessing `va` through `space`'s entry, setting the reference bit
    /// and, for writes, the change bit. Returns false if the mapping is not resident.
    #[cfg(any(test, feature = "software-emulation", not(target_arch = "powerpc")))]
    pub fn record_access(&self, space: AddressSpace, va: VirtualAddress, write: bool) -> bool {
        let mut state = self.lock();
        let Some(handle) = state.lookup(space, va) else {
            return false;
        };
        match state.resident_slot(handle) {
            Some(slot) => {
                state.table.record_access(slot, write);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&mut PmapState) -> T) -> T {
        f(&mut self.lock())
    }
}

/// Invalidates every TLB congruence class.
fn flush_translations<H: HardwareTlbPort + ?Sized>(hw: &H) {
    for page in (0..0x40000).step_by(PAGE_SIZE) {
        hw.invalidate(VirtualAddress::new(page));
    }
    hw.sync_global();
}

impl PmapState {
    /// Returns true if `pa` is ordinary memory rather than a device.
    pub(crate) fn is_memory(&self, pa: PhysicalAddress) -> bool {
        self.memory.iter().any(|region| region.contains(pa, PAGE_SIZE))
    }

    /// Finds the mapping of `va` in `space`.
    pub(crate) fn lookup(&self, space: AddressSpace, va: VirtualAddress) -> Option<PvoHandle> {
        let vsid = self.spaces.get(space).vsid(va.segment());
        let bucket = self.table.hash(vsid, va);
        self.store.find(space, va, bucket)
    }

    pub(crate) fn chain_for<'r, R: PageRecords + ?Sized>(records: &'r R, pvo: &Pvo) -> PageChain<'r> {
        if !pvo.is_managed() {
            return PageChain::Unmanaged;
        }
        match records.record(pvo.physical_address()) {
            Some(frame) => PageChain::Managed(frame),
            None => panic!(
                "pvo_check: managed mapping of {} has no page record",
                pvo.physical_address()
            ),
        }
    }

    /// Returns the slot of a resident mapping after checking the slot really holds it.
    ///
    /// # Panics
    ///
    /// Panics if the mapping's residency fields disagree with each other or with the table.
    pub(crate) fn resident_slot(&self, handle: PvoHandle) -> Option<PteSlot> {
        let pvo = self.store.get(handle);
        let Some(slot) = pvo.slot else {
            assert!(
                !pvo.pte.is_valid(),
                "pvo_check: {:?} at {} has a valid PTE but no slot",
                pvo.space,
                pvo.va
            );
            return None;
        };
        assert!(
            pvo.pte.is_valid(),
            "pvo_check: {:?} at {} has a slot but an invalid PTE",
            pvo.space,
            pvo.va
        );
        let group = self.table.group_for(pvo.bucket, pvo.position());
        assert!(
            slot.group() == group,
            "pvo_check: {:?} at {} is in {:?}, outside group {}",
            pvo.space,
            pvo.va,
            slot,
            group
        );
        let hardware = self.table.entry(slot);
        assert!(
            pvo.pte.matches_hardware(&hardware),
            "pvo_check: PTE in {:?} does not match mapping {:?} at {}: {:?} != {:?}",
            slot,
            pvo.space,
            pvo.va,
            hardware,
            pvo.pte
        );
        Some(slot)
    }

    /// Folds the hardware reference/change bits of a resident mapping into its copy.
    pub(crate) fn synchronize(&mut self, handle: PvoHandle) {
        if let Some(slot) = self.resident_slot(handle) {
            let pvo = self.store.get_mut(handle);
            self.table.synchronize(slot, &mut pvo.pte);
        }
    }

    /// Creates the mapping object for `(space, va)`, replacing any existing one, and tries
    /// to make it resident.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn pvo_enter<H, F, R>(
        &mut self,
        hw: &H,
        frames: &F,
        records: &R,
        space: AddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        lo: u32,
        flags: PvoFlags,
        chain: &PageChain<'_>,
        mode: AllocMode,
    ) -> Result<Entered, PmapError>
    where
        H: HardwareTlbPort + ?Sized,
        F: FrameSource + ?Sized,
        R: PageRecords + ?Sized,
    {
        self.counters.enter_calls += 1;
        let vsid = self.spaces.get(space).vsid(va.segment());
        let bucket = self.table.hash(vsid, va);

        let replaced = match self.store.find(space, va, bucket) {
            Some(old) => {
                self.pvo_remove(hw, records, old);
                true
            }
            None => false,
        };
        let pvo = Pvo::new(space, va, Pte::new(vsid, va, pa, lo), flags, bucket);
        let handle = match self.store.insert(pvo, chain, frames, mode) {
            Ok(handle) => handle,
            Err(err) => {
                if !self.reclaim(hw, records) {
                    return Err(err);
                }
                self.store.insert(pvo, chain, frames, mode)?
            }
        };
        // Linked at the head, so the page had no other mapping if nothing follows.
        let first = self.store.next_on_page(handle).is_none();

        let stats = &mut self.spaces.get_mut(space).stats;
        stats.resident += 1;
        if flags.contains(PvoFlags::WIRED) {
            stats.wired += 1;
        }

        let pvo = self.store.get_mut(handle);
        match self.table.insert(hw, bucket, &mut pvo.pte) {
            Some(slot) => pvo.slot = Some(slot),
            None => self.counters.overflow += 1,
        }
        log::trace!(
            "pvo_enter: {:?} {} -> {} {:?}",
            space,
            va,
            pa,
            self.store.get(handle).slot
        );

        Ok(if first {
            Entered::FirstMapping
        } else if replaced {
            Entered::Replaced
        } else {
            Entered::Added
        })
    }

    /// Drops one unwired mapping so its storage can be reused, scanning buckets round-robin
    /// from where the previous reclaim stopped. Returns false if every mapping is wired.
    fn reclaim<H, R>(&mut self, hw: &H, records: &R) -> bool
    where
        H: HardwareTlbPort + ?Sized,
        R: PageRecords + ?Sized,
    {
        let buckets = self.store.bucket_count();
        for step in 1..=buckets {
            let bucket = (self.reclaim_next + step) % buckets;
            let victim = self
                .store
                .bucket(bucket)
                .find(|(_, pvo)| !pvo.is_wired())
                .map(|(handle, pvo)| (handle, pvo.space, pvo.va));
            if let Some((handle, space, va)) = victim {
                log::debug!("pvo_reclaim: dropping {} in {:?}", va, space);
                self.pvo_remove(hw, records, handle);
                self.reclaim_next = bucket;
                self.counters.reclaimed += 1;
                return true;
            }
        }
        false
    }

    /// Spills a kernel mapping that did not fit in its bucket pair into the table, evicting a
    /// user entry.
    ///
    /// # Panics
    ///
    /// Panics if the mapping cannot be made resident.
    fn make_kernel_resident<H, E>(&mut self, hw: &H, eviction: &E, va: VirtualAddress)
    where
        H: HardwareTlbPort + ProcessorPort + ?Sized,
        E: EvictionPolicy + ?Sized,
    {
        let resident = self
            .lookup(AddressSpace::KERNEL, va)
            .is_some_and(|handle| self.store.get(handle).slot.is_some());
        if resident {
            return;
        }
        let vsid = self.spaces.get(AddressSpace::KERNEL).vsid(va.segment());
        assert!(
            self.spill_vsid(hw, eviction, va, vsid),
            "pvo_enter: kernel mapping of {} is not resident",
            va
        );
    }

    /// Destroys a mapping object: evicts its entry, saves its reference/change history to
    /// the page, and unlinks it from both chains.
    pub(crate) fn pvo_remove<H, R>(&mut self, hw: &H, records: &R, handle: PvoHandle)
    where
        H: HardwareTlbPort + ?Sized,
        R: PageRecords + ?Sized,
    {
        self.counters.remove_calls += 1;
        let slot = self.resident_slot(handle);
        let pvo = self.store.get_mut(handle);
        match slot {
            Some(slot) => {
                self.table.unset(hw, slot, &mut pvo.pte, pvo.va);
                pvo.slot = None;
            }
            None => self.counters.overflow -= 1,
        }
        let pvo = *pvo;

        let stats = &mut self.spaces.get_mut(pvo.space).stats;
        stats.resident -= 1;
        if pvo.is_wired() {
            stats.wired -= 1;
        }

        let chain = Self::chain_for(records, &pvo);
        if let PageChain::Managed(frame) = chain {
            frame.save_pte_bits(pvo.pte.lo());
        }
        self.store.remove(handle, &chain);
        log::trace!("pvo_remove: {:?} {}", pvo.space, pvo.va);
    }

    fn verify<R: PageRecords + ?Sized>(&self, records: &R) {
        let mut total = 0;
        let mut resident = 0;
        for bucket in 0..self.store.bucket_count() {
            for (handle, pvo) in self.store.bucket(bucket) {
                total += 1;
                let vsid = self.spaces.get(pvo.space).vsid(pvo.va.segment());
                assert!(
                    pvo.bucket == bucket && self.table.hash(vsid, pvo.va) == bucket,
                    "pvo_verify: {:?} at {} is on bucket {} but hashes to {}",
                    pvo.space,
                    pvo.va,
                    bucket,
                    self.table.hash(vsid, pvo.va)
                );
                assert!(
                    pvo.pte.translates(vsid, pvo.va),
                    "pvo_verify: PTE of {:?} at {} does not translate its own address",
                    pvo.space,
                    pvo.va
                );
                assert!(
                    self.store.find(pvo.space, pvo.va, bucket) == Some(handle),
                    "pvo_verify: {:?} at {} is mapped more than once",
                    pvo.space,
                    pvo.va
                );
                let chain = Self::chain_for(records, pvo);
                assert!(
                    self.store.page(&chain).any(|(other, _)| other == handle),
                    "pvo_verify: {:?} at {} is missing from its physical page chain",
                    pvo.space,
                    pvo.va
                );
                if self.resident_slot(handle).is_some() {
                    resident += 1;
                }
            }
        }
        assert!(
            total == self.store.len(),
            "pvo_verify: {} mappings reachable from buckets, {} allocated",
            total,
            self.store.len()
        );
        assert!(
            resident == self.table.valid_count(),
            "pvo_verify: {} resident mappings but {} valid PTEs",
            resident,
            self.table.valid_count()
        );
        assert!(
            total - resident == self.counters.overflow,
            "pvo_verify: {} non-resident mappings but overflow count is {}",
            total - resident,
            self.counters.overflow
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PVOS_PER_FRAME;
    use crate::testing::{self, TestPmap, cached_pa, kernel_va, managed_pa, user_va};
    use crate::{EmulatedMmu, PteBit, TlbEvent};

    #[test]
    fn bootstrap_loads_table_and_kernel_segments() {
        let pmap = testing::pmap(16);
        let events = pmap.hardware().take_events();
        assert!(matches!(events[0], TlbEvent::LoadTable(_, 15)));
        let loads = events
            .iter()
            .filter(|e| matches!(e, TlbEvent::LoadSegment(..)))
            .count();
        assert_eq!(loads, SEGMENT_COUNT);
        assert_eq!(events.last(), Some(&TlbEvent::SyncGlobal));
        assert_eq!(
            pmap.hardware().segment(KERNEL_SEGMENT),
            SegmentId::KERNEL.vsid(KERNEL_SEGMENT)
        );

        let stats = pmap.statistics();
        assert_eq!(stats.pteg_count, 16);
        assert_eq!(stats.address_spaces, 1);
        assert_eq!(stats.pte_valid, 0);
    }

    #[test]
    fn bootstrap_sizes_table_from_memory() {
        let pmap = testing::pmap_with(PmapConfig::default());
        assert_eq!(
            pmap.statistics().pteg_count,
            pteg_count_for(testing::EMULATED_MEMORY / PAGE_SIZE)
        );
    }

    #[test]
    fn enter_then_extract_round_trips() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let va = user_va(0x1234_5000);
        let pa = managed_pa(3);

        let entered = pmap
            .enter(space, va, pa, Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        assert_eq!(entered, Entered::FirstMapping);
        assert_eq!(pmap.extract(space, va + 0x123), Some(pa + 0x123));

        let mapping = pmap.find(space, va).unwrap();
        assert_eq!(mapping.protection, Protection::READ_WRITE);
        assert!(mapping.resident.is_some());
        assert!(mapping.managed);
        assert!(mapping.cache_inhibited, "managed pages outside boot memory are not cacheable");
        assert_eq!(pmap.space_statistics(space).resident, 1);
        pmap.verify();
    }

    #[test]
    fn create_on_a_fresh_processor() {
        let pmap = testing::pmap(16);
        pmap.hardware().set_timebase(0);
        let a = pmap.create();
        pmap.hardware().set_timebase(0);
        let b = pmap.create();
        assert_ne!(a, b);
        let ids = pmap.with_state(|state| (state.spaces.get(a).id, state.spaces.get(b).id));
        assert_ne!(ids.0, ids.1);
        assert_eq!(pmap.statistics().address_spaces, 3);
    }

    #[test]
    fn enter_reports_replacement_and_sharing() {
        let pmap = testing::pmap(16);
        let a = pmap.create();
        let b = pmap.create();
        let pa = managed_pa(1);
        let va = user_va(0x1000);

        assert_eq!(
            pmap.enter(a, va, pa, Protection::READ, EnterFlags::empty()),
            Ok(Entered::FirstMapping)
        );
        assert_eq!(
            pmap.enter(b, va, pa, Protection::READ, EnterFlags::empty()),
            Ok(Entered::Added)
        );
        // Moving onto an unmapped page is still the first mapping of that page.
        assert_eq!(
            pmap.enter(a, va, managed_pa(2), Protection::READ, EnterFlags::empty()),
            Ok(Entered::FirstMapping)
        );
        assert_eq!(
            pmap.enter(b, va, managed_pa(2), Protection::READ, EnterFlags::empty()),
            Ok(Entered::Replaced)
        );
        assert_eq!(pmap.extract(a, va), Some(managed_pa(2)));
        assert!(pmap.mappings_of(pa).is_empty());
        assert_eq!(pmap.mappings_of(managed_pa(2)).len(), 2);
        assert_eq!(pmap.statistics().pvo_entries, 2);
        pmap.verify();
    }

    #[test]
    fn spaces_do_not_share_translations() {
        let pmap = testing::pmap(16);
        let a = pmap.create();
        let b = pmap.create();
        let va = user_va(0x0040_0000);
        pmap.enter(a, va, managed_pa(1), Protection::READ, EnterFlags::empty())
            .unwrap();
        assert_eq!(pmap.extract(b, va), None);
        pmap.remove(b, va, va + PAGE_SIZE);
        assert_eq!(pmap.extract(a, va), Some(managed_pa(1)));
    }

    #[test]
    fn remove_is_idempotent() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let va = user_va(0x2000);
        pmap.enter(space, va, managed_pa(1), Protection::READ, EnterFlags::empty())
            .unwrap();

        pmap.remove(space, va, va + PAGE_SIZE);
        let after_first = pmap.statistics();
        pmap.remove(space, va, va + PAGE_SIZE);
        let after_second = pmap.statistics();

        assert_eq!(pmap.extract(space, va), None);
        assert_eq!(after_first.pvo_entries, 0);
        assert_eq!(after_first.pte_valid, 0);
        assert_eq!(after_first.pvo_entries, after_second.pvo_entries);
        assert_eq!(after_first.pvo_remove_calls, after_second.pvo_remove_calls);
        pmap.verify();
    }

    #[test]
    fn remove_evicts_with_ordered_invalidation() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let va = user_va(0x3000);
        pmap.enter(space, va, managed_pa(1), Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        assert!(pmap.record_access(space, va, true));
        pmap.hardware().take_events();

        pmap.remove(space, va, va + PAGE_SIZE);
        assert_eq!(
            testing::tlb_events(pmap.hardware()),
            vec![
                TlbEvent::SyncLocal,
                TlbEvent::SyncLocal,
                TlbEvent::Invalidate(va),
                TlbEvent::SyncGlobal,
            ]
        );
        // R/C bits harvested after the invalidation survive in the page record.
        assert!(pmap.query_bit(managed_pa(1), PteBit::Change));
        assert!(pmap.query_bit(managed_pa(1), PteBit::Reference));
    }

    #[test]
    fn remove_range_skips_holes() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let base = user_va(0x10000);
        for i in [0usize, 2, 5] {
            pmap.enter(
                space,
                base + i * PAGE_SIZE,
                managed_pa(i),
                Protection::READ,
                EnterFlags::empty(),
            )
            .unwrap();
        }
        pmap.remove(space, base, base + 3 * PAGE_SIZE);
        assert_eq!(pmap.extract(space, base), None);
        assert_eq!(pmap.extract(space, base + 2 * PAGE_SIZE), None);
        assert_eq!(pmap.extract(space, base + 5 * PAGE_SIZE), Some(managed_pa(5)));
        assert_eq!(pmap.space_statistics(space).resident, 1);
    }

    #[test]
    fn unmanaged_pages_are_not_tracked_per_page() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let device = PhysicalAddress::new(0xf000_0000);
        pmap.enter(space, user_va(0x5000), device, Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        let mapping = pmap.find(space, user_va(0x5000)).unwrap();
        assert!(!mapping.managed);
        assert!(mapping.cache_inhibited);
        assert!(!pmap.query_bit(device, PteBit::Reference));
        pmap.verify();
    }

    #[test]
    fn boot_memory_is_mapped_cacheable_unless_asked_otherwise() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let ram = PhysicalAddress::new(0x8000);
        pmap.enter(space, user_va(0x1000), ram, Protection::READ, EnterFlags::empty())
            .unwrap();
        pmap.enter(space, user_va(0x2000), ram, Protection::READ, EnterFlags::empty().no_cache())
            .unwrap();
        assert!(!pmap.find(space, user_va(0x1000)).unwrap().cache_inhibited);
        assert!(pmap.find(space, user_va(0x2000)).unwrap().cache_inhibited);
    }

    #[test]
    fn executable_pages_sync_the_icache_once() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let ram = cached_pa(0);
        pmap.hardware().take_events();

        pmap.enter(space, user_va(0x1000), ram, Protection::READ_EXECUTE, EnterFlags::empty())
            .unwrap();
        pmap.enter(space, user_va(0x2000), ram, Protection::READ_EXECUTE, EnterFlags::empty())
            .unwrap();
        let syncs = pmap
            .hardware()
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, TlbEvent::SyncIcache(..)))
            .count();
        assert_eq!(syncs, 1);
        assert_eq!(
            pmap.find(space, user_va(0x2000)).unwrap().protection,
            Protection::READ_EXECUTE
        );
    }

    #[test]
    fn wired_accounting_and_unwire() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let va = user_va(0x1000);
        pmap.enter(space, va, managed_pa(1), Protection::READ, EnterFlags::empty().wired())
            .unwrap();
        assert_eq!(pmap.space_statistics(space).wired, 1);
        pmap.unwire(space, va);
        pmap.unwire(space, va);
        assert_eq!(pmap.space_statistics(space).wired, 0);
        assert!(!pmap.find(space, va).unwrap().wired);
    }

    #[test]
    fn kernel_enter_is_wired_and_unmanaged() {
        let pmap = testing::pmap(16);
        let va = kernel_va(0x4000);
        pmap.kernel_enter(va, managed_pa(7), Protection::READ_WRITE);
        let mapping = pmap.find(AddressSpace::KERNEL, va).unwrap();
        assert!(mapping.wired);
        assert!(!mapping.managed);
        assert_eq!(pmap.space_statistics(AddressSpace::KERNEL).wired, 1);
        assert!(pmap.mappings_of(managed_pa(7)).is_empty());

        pmap.kernel_remove(va, PAGE_SIZE);
        assert_eq!(pmap.extract(AddressSpace::KERNEL, va), None);
        pmap.verify();
    }

    #[test]
    #[should_panic(expected = "is below the kernel segment")]
    fn kernel_enter_below_kernel_segment_is_fatal() {
        let pmap = testing::pmap(16);
        pmap.kernel_enter(user_va(0x1000), managed_pa(1), Protection::READ);
    }

    #[test]
    fn enter_can_fail_when_out_of_memory() {
        let pmap = testing::starved_pmap();
        let space = pmap.create();
        let result = pmap.enter(
            space,
            user_va(0x1000),
            managed_pa(1),
            Protection::READ,
            EnterFlags::empty().can_fail(),
        );
        assert_eq!(result, Err(PmapError::OutOfMemory));
        assert_eq!(pmap.statistics().pvo_entries, 0);
        assert_eq!(pmap.space_statistics(space).resident, 0);
    }

    #[test]
    #[should_panic(expected = "pmap_enter: out of memory")]
    fn enter_without_can_fail_panics_when_out_of_memory() {
        let pmap = testing::starved_pmap();
        let space = pmap.create();
        let _ = pmap.enter(
            space,
            user_va(0x1000),
            managed_pa(1),
            Protection::READ,
            EnterFlags::empty(),
        );
    }

    #[test]
    fn exhausted_pool_reclaims_an_unwired_mapping() {
        let pmap = testing::single_frame_pmap();
        let space = pmap.create();
        let wired = user_va(0x1000);
        let page = |i: usize| user_va(0x0010_0000 + i * PAGE_SIZE);
        pmap.enter(space, wired, managed_pa(0), Protection::READ, EnterFlags::empty().wired())
            .unwrap();
        for i in 1..PVOS_PER_FRAME {
            pmap.enter(space, page(i), managed_pa(i % 8), Protection::READ, EnterFlags::empty())
                .unwrap();
        }
        assert_eq!(pmap.statistics().pvo_entries, PVOS_PER_FRAME);

        let extra = page(PVOS_PER_FRAME);
        assert_eq!(
            pmap.enter(space, extra, managed_pa(9), Protection::READ, EnterFlags::empty().can_fail()),
            Ok(Entered::FirstMapping)
        );
        let stats = pmap.statistics();
        assert_eq!(stats.pvo_reclaimed, 1);
        assert_eq!(stats.pvo_entries, PVOS_PER_FRAME);
        assert_eq!(pmap.extract(space, extra), Some(managed_pa(9)));
        assert_eq!(pmap.extract(space, wired), Some(managed_pa(0)));
        let dropped = (1..PVOS_PER_FRAME)
            .filter(|&i| pmap.extract(space, page(i)).is_none())
            .count();
        assert_eq!(dropped, 1);
        pmap.verify();
    }

    #[test]
    fn wired_mappings_are_never_reclaimed() {
        let pmap = testing::single_frame_pmap();
        let space = pmap.create();
        let page = |i: usize| user_va(0x0010_0000 + i * PAGE_SIZE);
        for i in 0..PVOS_PER_FRAME {
            pmap.enter(space, page(i), managed_pa(i % 8), Protection::READ, EnterFlags::empty().wired())
                .unwrap();
        }
        let result = pmap.enter(
            space,
            page(PVOS_PER_FRAME),
            managed_pa(9),
            Protection::READ,
            EnterFlags::empty().can_fail(),
        );
        assert_eq!(result, Err(PmapError::OutOfMemory));
        assert_eq!(pmap.statistics().pvo_reclaimed, 0);
        assert_eq!(pmap.space_statistics(space).wired, PVOS_PER_FRAME);
        pmap.verify();
    }

    #[test]
    fn destroy_releases_identifiers_and_leftover_mappings() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        pmap.add_reference(space);
        pmap.enter(space, user_va(0x1000), managed_pa(1), Protection::READ, EnterFlags::empty())
            .unwrap();

        pmap.destroy(space);
        assert_eq!(pmap.statistics().address_spaces, 2);
        pmap.destroy(space);
        let stats = pmap.statistics();
        assert_eq!(stats.address_spaces, 1);
        assert_eq!(stats.pvo_entries, 0);
        assert_eq!(stats.pte_valid, 0);
        assert!(pmap.mappings_of(managed_pa(1)).is_empty());
        pmap.with_state(|state| assert_eq!(state.vsids.live(), 0));
    }

    #[test]
    #[should_panic(expected = "is not a live address space")]
    fn destroyed_space_cannot_be_used() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        pmap.destroy(space);
        let _ = pmap.enter(space, user_va(0x1000), managed_pa(1), Protection::READ, EnterFlags::empty());
    }

    #[test]
    fn activate_loads_all_but_the_kernel_segment() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        pmap.hardware().take_events();
        pmap.activate(space);

        let loaded: Vec<usize> = pmap
            .hardware()
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                TlbEvent::LoadSegment(segment, _) => Some(segment),
                _ => None,
            })
            .collect();
        assert_eq!(loaded.len(), SEGMENT_COUNT - 1);
        assert!(!loaded.contains(&KERNEL_SEGMENT));
        assert_eq!(
            pmap.hardware().segment(KERNEL_SEGMENT),
            SegmentId::KERNEL.vsid(KERNEL_SEGMENT)
        );
        assert!(pmap.hardware().interrupts_enabled());
        pmap.deactivate(space);
    }

    #[test]
    fn bucket_depths_count_every_mapping() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        for i in 0..20 {
            pmap.enter(
                space,
                user_va(i * PAGE_SIZE),
                managed_pa(i),
                Protection::READ,
                EnterFlags::empty(),
            )
            .unwrap();
        }
        let distribution = pmap.bucket_depths();
        let counted: usize = distribution
            .depths
            .iter()
            .enumerate()
            .map(|(depth, buckets)| depth * buckets)
            .sum();
        assert_eq!(counted, 20);
        assert_eq!(distribution.depths.iter().sum::<usize>(), 16);
        assert_eq!(distribution.depths.len(), distribution.max_depth + 1);
    }

    #[test]
    #[should_panic(expected = "pvo_check: PTE in")]
    fn corrupted_slot_is_detected() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let va = user_va(0x1000);
        pmap.enter(space, va, managed_pa(1), Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        pmap.with_state(|state| {
            let handle = state.lookup(space, va).unwrap();
            let slot = state.store.get(handle).slot.unwrap();
            let mut bogus = state.table.entry(slot);
            bogus.set_read_only();
            state.table.overwrite(slot, bogus);
        });
        pmap.verify();
    }

    #[test]
    fn software_mmu_only_touches_resident_mappings() {
        let pmap: TestPmap = testing::pmap(16);
        let space = pmap.create();
        assert!(!pmap.record_access(space, user_va(0x1000), false));
        let _: &EmulatedMmu = pmap.hardware();
    }
}
