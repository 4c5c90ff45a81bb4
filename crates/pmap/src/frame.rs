//! Per-physical-page records and the collaborator traits that supply them.

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use crate::PhysicalAddress;
use crate::mapping::PvoHandle;
use crate::pte::{PTE_CHG, PTE_REF};

/// Holds the page-table manager's metadata for one managed physical page.
///
/// Modeled after a `vm_page`'s machine-dependent part: a cache of attribute bits harvested
/// from mappings that no longer exist, and the head of the page's mapping chain.
pub struct Frame {
    attributes: AtomicU8,
    mappings: AtomicU32,
}

/// Attribute bits cached per physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAttribute {
    /// Some mapping of the page has been accessed.
    Referenced = 1 << 0,
    /// Some mapping of the page has been written.
    Modified = 1 << 1,
    /// The instruction cache is known to be coherent for this page.
    Executable = 1 << 2,
}

const NO_MAPPING: u32 = u32::MAX;

impl Frame {
    pub const fn new() -> Self {
        Self {
            attributes: AtomicU8::new(0),
            mappings: AtomicU32::new(NO_MAPPING),
        }
    }

    /// Tests a cached attribute.
    pub fn test(&self, attribute: PageAttribute) -> bool {
        self.attributes.load(Ordering::Acquire) & attribute as u8 != 0
    }

    /// Sets a cached attribute, returning its previous value.
    pub fn test_and_set(&self, attribute: PageAttribute) -> bool {
        let mask = attribute as u8;
        self.attributes.fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clears a cached attribute.
    pub fn clear(&self, attribute: PageAttribute) {
        self.attributes
            .fetch_and(!(attribute as u8), Ordering::AcqRel);
    }

    /// Folds the reference/change bits of a PTE low word into the cache.
    pub(crate) fn save_pte_bits(&self, lo: u32) {
        let mut bits = 0;
        if lo & PTE_REF != 0 {
            bits |= PageAttribute::Referenced as u8;
        }
        if lo & PTE_CHG != 0 {
            bits |= PageAttribute::Modified as u8;
        }
        if bits != 0 {
            self.attributes.fetch_or(bits, Ordering::AcqRel);
        }
    }

    pub(crate) fn mappings(&self) -> Option<PvoHandle> {
        match self.mappings.load(Ordering::Acquire) {
            NO_MAPPING => None,
            raw => Some(PvoHandle::from_raw(raw)),
        }
    }

    pub(crate) fn set_mappings(&self, head: Option<PvoHandle>) {
        let raw = head.map_or(NO_MAPPING, PvoHandle::into_raw);
        self.mappings.store(raw, Ordering::Release);
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

/// How an allocation may behave when no frame is immediately available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// The caller may sleep until memory is reclaimed.
    Blocking,
    /// The caller is on a fault or interrupt path and must not sleep.
    NonBlocking,
}

/// Supplies page frames for mapping-object storage.
pub trait FrameSource {
    /// Allocates one zeroed-or-not page frame.
    fn alloc_frame(&self, mode: AllocMode) -> Option<PhysicalAddress>;

    /// Returns a frame obtained from [`alloc_frame`](Self::alloc_frame).
    fn free_frame(&self, frame: PhysicalAddress);
}

impl<T: FrameSource + ?Sized> FrameSource for &T {
    fn alloc_frame(&self, mode: AllocMode) -> Option<PhysicalAddress> {
        (**self).alloc_frame(mode)
    }

    fn free_frame(&self, frame: PhysicalAddress) {
        (**self).free_frame(frame)
    }
}

/// Reverse lookup from a physical address to its page record.
///
/// Pages with a record are *managed*: their mappings are chained on the record and their
/// reference/change history is kept. Everything else (device memory, early boot mappings)
/// is unmanaged.
pub trait PageRecords {
    fn record(&self, pa: PhysicalAddress) -> Option<&Frame>;
}

impl<T: PageRecords + ?Sized> PageRecords for &T {
    fn record(&self, pa: PhysicalAddress) -> Option<&Frame> {
        (**self).record(pa)
    }
}
