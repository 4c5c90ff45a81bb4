//! Software emulation implementation for testing and development.
//!
//! This module provides a software-emulated OEA MMU that can run on any host. The page
//! table format is the real one; only the processor side is simulated:
//!
//! - TLB invalidations and barriers are recorded, in order, as [`TlbEvent`]s.
//! - Segment registers are an in-memory array.
//! - The time base is a counter that advances on every read.
//! - Physical memory is a page-aligned host buffer ([`EmulatedMemory`]).
//!
//! Tables are kept small (the minimum is 16 groups) so overflow and eviction paths are
//! easy to reach from tests.

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::port::{HardwareTlbPort, ProcessorPort};
use crate::{PAGE_SIZE, PhysicalAddress, SEGMENT_COUNT, VirtualAddress, Vsid};

/// Smallest hashed page table the emulation will size automatically, in groups.
pub const MIN_PTEG_COUNT: usize = 16;

/// A processor event observed by the emulated MMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbEvent {
    /// A single-page invalidation (`tlbie`).
    Invalidate(VirtualAddress),
    /// A local ordering barrier (`sync`/`eieio`).
    SyncLocal,
    /// A global completion barrier (`tlbsync; sync`).
    SyncGlobal,
    /// A segment register load.
    LoadSegment(usize, Vsid),
    /// The page table base register was loaded.
    LoadTable(PhysicalAddress, usize),
    /// The instruction cache was synchronized for a range.
    SyncIcache(PhysicalAddress, usize),
    InterruptsDisabled,
    InterruptsRestored,
}

/// The emulated processor.
pub struct EmulatedMmu {
    events: spin::Mutex<Vec<TlbEvent>>,
    recording: AtomicBool,
    timebase: AtomicU64,
    segments: spin::Mutex<[Vsid; SEGMENT_COUNT]>,
    interrupts: AtomicBool,
}

impl EmulatedMmu {
    /// Creates an emulated processor with interrupts enabled and every segment register zero.
    pub fn new() -> Self {
        Self {
            events: spin::Mutex::new(Vec::new()),
            recording: AtomicBool::new(true),
            timebase: AtomicU64::new(0),
            segments: spin::Mutex::new([Vsid::new(0); SEGMENT_COUNT]),
            interrupts: AtomicBool::new(true),
        }
    }

    /// Drains and returns every event recorded so far.
    pub fn take_events(&self) -> Vec<TlbEvent> {
        core::mem::take(&mut *self.events.lock())
    }

    /// Enables or disables event recording. Long-running tests turn it off to save memory.
    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Relaxed);
    }

    /// Sets the next value the time base will return.
    pub fn set_timebase(&self, value: u64) {
        self.timebase.store(value, Ordering::Relaxed);
    }

    /// Returns whether interrupts are currently enabled.
    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::Relaxed)
    }

    fn record(&self, event: TlbEvent) {
        if self.recording.load(Ordering::Relaxed) {
            self.events.lock().push(event);
        }
    }
}

impl Default for EmulatedMmu {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareTlbPort for EmulatedMmu {
    fn invalidate(&self, va: VirtualAddress) {
        self.record(TlbEvent::Invalidate(va.align_down(PAGE_SIZE)));
    }

    fn sync_local(&self) {
        self.record(TlbEvent::SyncLocal);
    }

    fn sync_global(&self) {
        self.record(TlbEvent::SyncGlobal);
    }

    fn timebase(&self) -> u64 {
        self.timebase.fetch_add(1, Ordering::Relaxed)
    }
}

impl ProcessorPort for EmulatedMmu {
    fn disable_interrupts(&self) -> usize {
        let previous = self.interrupts.swap(false, Ordering::Relaxed);
        self.record(TlbEvent::InterruptsDisabled);
        previous as usize
    }

    fn restore_interrupts(&self, state: usize) {
        self.interrupts.store(state != 0, Ordering::Relaxed);
        self.record(TlbEvent::InterruptsRestored);
    }

    fn load_segment(&self, segment: usize, vsid: Vsid) {
        self.segments.lock()[segment] = vsid;
        self.record(TlbEvent::LoadSegment(segment, vsid));
    }

    fn segment(&self, segment: usize) -> Vsid {
        self.segments.lock()[segment]
    }

    fn load_table(&self, base: PhysicalAddress, mask: usize) {
        self.record(TlbEvent::LoadTable(base, mask));
    }

    fn sync_icache(&self, pa: PhysicalAddress, len: usize) {
        self.record(TlbEvent::SyncIcache(pa, len));
    }
}

/// Emulated memory for software simulation.
///
/// A zeroed, page-aligned host allocation standing in for physical memory. Physical address
/// `n` is byte `n` of the buffer, so page boundaries in the emulated physical space are page
/// boundaries on the host too.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: The buffer is owned exclusively by this value; access is coordinated by callers.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new emulated memory region of the specified size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or not a multiple of the page size, or if the host
    /// allocation fails.
    pub fn new(size: usize) -> Self {
        assert!(
            size != 0 && size % PAGE_SIZE == 0,
            "emulated memory must be a whole number of pages"
        );
        let layout = Layout::from_size_align(size, PAGE_SIZE).expect("invalid emulated layout");
        // SAFETY: The layout has a non-zero size.
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("host allocation failed");
        Self { base, layout }
    }

    /// Translates a physical address to a virtual address (pointer into the buffer).
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address out of bounds");
        // SAFETY: Bounds checked above.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Translates a virtual address (pointer) back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = (ptr as usize).wrapping_sub(self.base.as_ptr() as usize);
        assert!(offset < self.size(), "pointer not within emulated memory");
        offset
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: Allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}
