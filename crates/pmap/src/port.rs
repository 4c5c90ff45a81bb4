//! Hardware ports.
//!
//! The page-table manager never touches processor state directly. Everything it needs from
//! the CPU goes through two narrow traits so that the same algorithms run against real
//! hardware and against the software-emulated MMU used in tests.

use crate::{PhysicalAddress, VirtualAddress, Vsid};

/// TLB maintenance and ordering primitives.
///
/// The ordering contract matters: the table code writes an entry, issues a barrier, and only
/// then publishes the word the MMU checks for validity. Evictions clear validity, issue a
/// barrier, invalidate the translation, then wait for the invalidation to complete
/// everywhere before harvesting the reference/change bits.
pub trait HardwareTlbPort {
    /// Invalidates any cached translation for the page containing `va`.
    fn invalidate(&self, va: VirtualAddress);

    /// Orders prior page-table stores before subsequent ones on this processor.
    fn sync_local(&self);

    /// Waits until all outstanding invalidations have completed on every processor.
    fn sync_global(&self);

    /// Reads the free-running time base. Used as an entropy source for eviction and
    /// identifier allocation.
    fn timebase(&self) -> u64;
}

/// Segment register, interrupt and cache control.
pub trait ProcessorPort {
    /// Disables external interrupts, returning the previous interrupt state.
    fn disable_interrupts(&self) -> usize;

    /// Restores an interrupt state returned by [`disable_interrupts`](Self::disable_interrupts).
    fn restore_interrupts(&self, state: usize);

    /// Loads segment register `segment` with `vsid`.
    fn load_segment(&self, segment: usize, vsid: Vsid);

    /// Reads the identifier currently loaded in segment register `segment`.
    fn segment(&self, segment: usize) -> Vsid;

    /// Points the MMU at a hashed page table of `mask + 1` groups starting at `base`.
    fn load_table(&self, base: PhysicalAddress, mask: usize);

    /// Makes instruction fetches from `len` bytes at `pa` coherent with prior data stores.
    fn sync_icache(&self, pa: PhysicalAddress, len: usize);
}

/// Suppresses interrupts on the local processor for as long as the guard is alive.
///
/// Only the local processor is affected; shared state still needs its own lock.
pub struct InterruptGuard<'a, P: ProcessorPort + ?Sized> {
    port: &'a P,
    state: usize,
}

impl<'a, P: ProcessorPort + ?Sized> InterruptGuard<'a, P> {
    /// Disables interrupts and returns a guard that restores them when dropped.
    pub fn new(port: &'a P) -> Self {
        let state = port.disable_interrupts();
        Self { port, state }
    }
}

impl<P: ProcessorPort + ?Sized> Drop for InterruptGuard<'_, P> {
    fn drop(&mut self) {
        self.port.restore_interrupts(self.state);
    }
}
