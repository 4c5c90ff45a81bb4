//! The hashed page table.
//!
//! A power-of-two array of page table entry groups (PTEGs), each holding eight entries, that
//! the MMU searches on a TLB miss. A translation for `(vsid, va)` may live in its primary
//! group, `(vsid ^ page_index(va)) & mask`, or in the secondary group (the primary index
//! with every mask bit flipped), with the `H` bit recording which.
//!
//! This module only knows about slots and entries. Which mapping owns a slot is tracked by
//! the mapping store; every write here follows the ordering the MMU requires, since other
//! processors may be walking the table concurrently.

use core::fmt;
use core::ptr::{NonNull, addr_of_mut};

use crate::arch::{MIN_PTEG_COUNT, PTES_PER_GROUP};
use crate::port::HardwareTlbPort;
use crate::pte::Pte;
use crate::{BootMemory, PhysicalAddress, VirtualAddress, Vsid};

const PTEG_SIZE: usize = PTES_PER_GROUP * core::mem::size_of::<Pte>();

/// Which of a translation's two candidate groups an entry occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashPosition {
    Primary,
    Secondary,
}

/// Identifies one entry of the table: group number times eight plus index in the group.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PteSlot(usize);

impl PteSlot {
    #[inline]
    pub const fn new(group: usize, index: usize) -> Self {
        assert!(index < PTES_PER_GROUP, "slot index out of range");
        Self(group * PTES_PER_GROUP + index)
    }

    /// The group this slot belongs to.
    #[inline]
    pub const fn group(self) -> usize {
        self.0 / PTES_PER_GROUP
    }

    /// The slot's position within its group.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 % PTES_PER_GROUP
    }
}

impl fmt::Debug for PteSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PteSlot({}:{})", self.group(), self.index())
    }
}

/// Returns the group count for a machine with `physical_pages` pages of memory: one group
/// per two pages, rounded down to a power of two, and never below the architecture minimum.
pub(crate) fn pteg_count_for(physical_pages: usize) -> usize {
    let mut count = MIN_PTEG_COUNT * 2;
    while count < physical_pages {
        count <<= 1;
    }
    count >> 1
}

/// The system-wide hashed page table.
pub(crate) struct PageTable {
    base: NonNull<Pte>,
    phys: PhysicalAddress,
    groups: usize,
    valid: usize,
}

// SAFETY: The table memory is carved exclusively for this structure; mutation is
// serialized by the owning `Pmap`'s lock.
unsafe impl Send for PageTable {}

impl PageTable {
    /// Carves a zeroed table of `groups` groups out of boot memory, aligned to its size.
    ///
    /// # Panics
    ///
    /// Panics if `groups` is not a power of two or if boot memory cannot satisfy the request.
    pub(crate) fn carve<B: BootMemory + ?Sized>(boot: &B, groups: usize) -> Self {
        assert!(
            groups.is_power_of_two(),
            "page table group count must be a power of two"
        );
        let size = groups * PTEG_SIZE;
        let phys = match boot.steal(size, size) {
            Ok(phys) => phys,
            Err(err) => panic!("page table: cannot carve {:#x} bytes: {:?}", size, err),
        };
        let base: *mut Pte = phys.to_ptr();
        // SAFETY: The region was just reserved for the table and is `size` bytes long.
        unsafe { core::ptr::write_bytes(base, 0, groups * PTES_PER_GROUP) };
        let base = match NonNull::new(base) {
            Some(base) => base,
            None => panic!("page table: carved memory is not addressable"),
        };
        Self {
            base,
            phys,
            groups,
            valid: 0,
        }
    }

    /// Physical base address, as loaded into the table base register.
    pub(crate) fn physical_base(&self) -> PhysicalAddress {
        self.phys
    }

    pub(crate) fn group_count(&self) -> usize {
        self.groups
    }

    /// Mask applied to hashes; also the value that maps a primary group to its secondary.
    pub(crate) fn mask(&self) -> usize {
        self.groups - 1
    }

    /// Number of entries currently marked valid in the table.
    pub(crate) fn valid_count(&self) -> usize {
        self.valid
    }

    /// Primary group index for `(vsid, va)`.
    #[inline]
    pub(crate) fn hash(&self, vsid: Vsid, va: VirtualAddress) -> usize {
        (vsid.as_u32() as usize ^ va.page_index()) & self.mask()
    }

    /// Returns the group a slot-holding entry must be in given its primary group and
    /// position.
    pub(crate) fn group_for(&self, primary: usize, position: HashPosition) -> usize {
        match position {
            HashPosition::Primary => primary,
            HashPosition::Secondary => primary ^ self.mask(),
        }
    }

    fn slot_ptr(&self, slot: PteSlot) -> *mut Pte {
        assert!(
            slot.group() < self.groups,
            "page table slot {:?} out of range",
            slot
        );
        // SAFETY: Bounds checked above.
        unsafe { self.base.as_ptr().add(slot.0) }
    }

    /// Reads the entry currently in `slot`.
    pub(crate) fn entry(&self, slot: PteSlot) -> Pte {
        // SAFETY: `slot_ptr` returns an in-bounds, aligned pointer into the table.
        unsafe { self.slot_ptr(slot).read_volatile() }
    }

    fn write_hi(&mut self, slot: PteSlot, hi: u32) {
        // SAFETY: `slot_ptr` returns an in-bounds, aligned pointer into the table.
        unsafe { addr_of_mut!((*self.slot_ptr(slot)).hi).write_volatile(hi) }
    }

    fn write_lo(&mut self, slot: PteSlot, lo: u32) {
        // SAFETY: `slot_ptr` returns an in-bounds, aligned pointer into the table.
        unsafe { addr_of_mut!((*self.slot_ptr(slot)).lo).write_volatile(lo) }
    }

    /// Installs `pte` into the first free slot of its primary group, then of its secondary
    /// group, updating the `H` bit to match.
    ///
    /// Returns the slot used, or `None` if both groups are full.
    pub(crate) fn insert<H: HardwareTlbPort + ?Sized>(
        &mut self,
        hw: &H,
        primary: usize,
        pte: &mut Pte,
    ) -> Option<PteSlot> {
        for position in [HashPosition::Primary, HashPosition::Secondary] {
            let group = self.group_for(primary, position);
            for index in 0..PTES_PER_GROUP {
                let slot = PteSlot::new(group, index);
                if !self.entry(slot).is_valid() {
                    pte.set_secondary(position == HashPosition::Secondary);
                    self.set(hw, slot, pte);
                    return Some(slot);
                }
            }
        }
        None
    }

    /// Makes `pte` live in `slot`.
    ///
    /// The low word is written first and ordered before the high word, so the MMU can
    /// never observe a valid entry with a stale low word.
    ///
    /// # Panics
    ///
    /// Panics if `pte` is already marked valid.
    pub(crate) fn set<H: HardwareTlbPort + ?Sized>(&mut self, hw: &H, slot: PteSlot, pte: &mut Pte) {
        assert!(!pte.is_valid(), "pte_set: setting an already valid PTE");
        pte.set_valid();
        self.write_lo(slot, pte.lo);
        hw.sync_local();
        self.write_hi(slot, pte.hi);
        hw.sync_local();
        self.valid += 1;

        #[cfg(feature = "detailed-logging")]
        log::trace!("pte_set: {:?} <- {:?}", slot, pte);
    }

    /// Evicts the entry in `slot`, which must be the hardware copy of `pte`, and folds the
    /// reference/change bits the MMU accumulated into `pte`.
    ///
    /// # Panics
    ///
    /// Panics if `pte` is not valid or the slot is already empty.
    pub(crate) fn unset<H: HardwareTlbPort + ?Sized>(
        &mut self,
        hw: &H,
        slot: PteSlot,
        pte: &mut Pte,
        va: VirtualAddress,
    ) {
        assert!(pte.is_valid(), "pte_unset: attempt to unset an invalid mapping");
        let mut hardware = self.entry(slot);
        assert!(
            hardware.is_valid(),
            "pte_unset: slot {:?} is already invalid",
            slot
        );

        // Invalidate the entry before dropping the TLB copy, then wait for every processor
        // to finish the invalidation before trusting the R/C bits.
        pte.clear_valid();
        hw.sync_local();
        hardware.clear_valid();
        self.write_hi(slot, hardware.hi);
        hw.sync_local();
        hw.invalidate(va);
        hw.sync_global();

        pte.harvest(&self.entry(slot));
        self.valid -= 1;

        #[cfg(feature = "detailed-logging")]
        log::trace!("pte_unset: {:?} -> {:?}", slot, pte);
    }

    /// Rewrites `slot` after the caller modified the valid entry `pte` in place (same
    /// translation, different attributes or protection).
    pub(crate) fn change<H: HardwareTlbPort + ?Sized>(
        &mut self,
        hw: &H,
        slot: PteSlot,
        pte: &mut Pte,
        va: VirtualAddress,
    ) {
        self.unset(hw, slot, pte, va);
        self.set(hw, slot, pte);
    }

    /// Copies the MMU-maintained reference/change bits of `slot` into `pte`.
    pub(crate) fn synchronize(&self, slot: PteSlot, pte: &mut Pte) {
        pte.harvest(&self.entry(slot));
    }

    /// Clears `bits` in the live entry and drops any cached translation of `va`.
    pub(crate) fn clear_bits<H: HardwareTlbPort + ?Sized>(
        &mut self,
        hw: &H,
        slot: PteSlot,
        va: VirtualAddress,
        bits: u32,
    ) {
        let lo = self.entry(slot).lo & !bits;
        self.write_lo(slot, lo);
        hw.sync_local();
        hw.invalidate(va);
        hw.sync_global();
    }

    /// Simulates the MMU recording an access through `slot`.
    #[cfg(any(test, feature = "software-emulation", not(target_arch = "powerpc")))]
    pub(crate) fn record_access(&mut self, slot: PteSlot, write: bool) {
        let mut bits = crate::pte::PTE_REF;
        if write {
            bits |= crate::pte::PTE_CHG;
        }
        let lo = self.entry(slot).lo | bits;
        self.write_lo(slot, lo);
    }

    /// Overwrites a slot without any bookkeeping, to simulate corruption.
    #[cfg(test)]
    pub(crate) fn overwrite(&mut self, slot: PteSlot, pte: Pte) {
        self.write_lo(slot, pte.lo);
        self.write_hi(slot, pte.hi);
    }
}
