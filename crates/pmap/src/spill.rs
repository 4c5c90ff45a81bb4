//! The software TLB-miss handler.
//!
//! The hashed table holds at most sixteen entries per bucket pair, while the mapping store
//! has no such limit. Mappings that did not fit are *overflowed*: present in software, absent
//! from the table. When the MMU misses on one of them the trap handler calls
//! [`Pmap::spill`], which installs the mapping, evicting a resident entry from the faulting
//! address's primary group if the pair is full.

use crate::arch::PTES_PER_GROUP;
use crate::page_table::PteSlot;
use crate::pmap::PmapState;
use crate::port::{HardwareTlbPort, ProcessorPort};
use crate::{AddressSpace, FrameSource, PAGE_SIZE, PageRecords, Pmap, VirtualAddress, Vsid};

/// Chooses which slot of a full group the spill handler evicts.
pub trait EvictionPolicy {
    /// Returns a slot index in `0..8` for `group`. `timebase` is a fresh time base reading.
    fn pick_slot(&self, group: usize, timebase: u64) -> usize;
}

/// Evicts pseudo-randomly, using the low bits of the time base.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimebaseEviction;

impl EvictionPolicy for TimebaseEviction {
    #[inline]
    fn pick_slot(&self, _group: usize, timebase: u64) -> usize {
        (timebase & (PTES_PER_GROUP as u64 - 1)) as usize
    }
}

impl<H, F, R, E> Pmap<H, F, R, E>
where
    H: HardwareTlbPort + ProcessorPort,
    F: FrameSource,
    R: PageRecords,
    E: EvictionPolicy,
{
    /// Handles a page-table miss on `va` in the currently active address space.
    ///
    /// Returns true if an overflowed mapping for `va` was installed, false if there is no
    /// such mapping and the fault must be handled as a genuine one.
    ///
    /// # Panics
    ///
    /// Panics if the primary group holds only kernel entries, or if the slot chosen for
    /// eviction has no owning mapping.
    pub fn spill(&self, va: VirtualAddress) -> bool {
        self.lock().spill(&self.hw, &self.eviction, va)
    }
}

impl PmapState {
    pub(crate) fn spill<H, E>(&mut self, hw: &H, eviction: &E, va: VirtualAddress) -> bool
    where
        H: HardwareTlbPort + ProcessorPort + ?Sized,
        E: EvictionPolicy + ?Sized,
    {
        let va = va.align_down(PAGE_SIZE);
        let vsid = hw.segment(va.segment());
        self.spill_vsid(hw, eviction, va, vsid)
    }

    /// Installs the overflowed mapping of the page `va` tagged `vsid`.
    ///
    /// If both groups of the pair are full, an entry of the primary group is evicted. The
    /// search starts at the slot the policy picks and skips kernel entries.
    pub(crate) fn spill_vsid<H, E>(
        &mut self,
        hw: &H,
        eviction: &E,
        va: VirtualAddress,
        vsid: Vsid,
    ) -> bool
    where
        H: HardwareTlbPort + ProcessorPort + ?Sized,
        E: EvictionPolicy + ?Sized,
    {
        self.counters.spills += 1;
        let primary = self.table.hash(vsid, va);

        let source = self
            .store
            .bucket(primary)
            .find(|(_, pvo)| pvo.slot.is_none() && pvo.va == va && pvo.pte.vsid() == vsid)
            .map(|(handle, _)| handle);
        let Some(source) = source else {
            return false;
        };

        let pvo = self.store.get_mut(source);
        if let Some(slot) = self.table.insert(hw, primary, &mut pvo.pte) {
            pvo.slot = Some(slot);
            self.counters.overflow -= 1;
            log::trace!("pte_spill: {} into free {:?}", va, slot);
            return true;
        }

        let first = eviction.pick_slot(primary, hw.timebase()) % PTES_PER_GROUP;
        let candidate = (0..PTES_PER_GROUP)
            .map(|i| PteSlot::new(primary, (first + i) % PTES_PER_GROUP))
            .find(|&slot| !self.table.entry(slot).vsid().is_kernel());
        let Some(candidate) = candidate else {
            panic!("pte_spill: every entry of group {} maps the kernel", primary);
        };

        // An occupant placed by secondary hash is on the partner bucket's chain.
        let victim = [primary, primary ^ self.table.mask()]
            .into_iter()
            .find_map(|bucket| {
                self.store
                    .bucket(bucket)
                    .find(|(_, pvo)| pvo.slot == Some(candidate))
                    .map(|(handle, _)| handle)
            });
        let Some(victim) = victim else {
            panic!(
                "pte_spill: no mapping object for victim {:?} ({:?})",
                candidate,
                self.table.entry(candidate)
            );
        };
        assert!(
            self.store.get(victim).space != AddressSpace::KERNEL,
            "pte_spill: victim in {:?} is a kernel mapping",
            candidate
        );

        let checked = self.resident_slot(victim);
        assert!(
            checked == Some(candidate),
            "pte_spill: victim of {:?} is resident in {:?}",
            candidate,
            checked
        );
        let evicted = self.store.get_mut(victim);
        self.table.unset(hw, candidate, &mut evicted.pte, evicted.va);
        evicted.slot = None;
        let evicted_va = evicted.va;

        let pvo = self.store.get_mut(source);
        pvo.pte.set_secondary(false);
        self.table.set(hw, candidate, &mut pvo.pte);
        pvo.slot = Some(candidate);
        self.counters.replacements += 1;

        log::trace!(
            "pte_spill: {} replaced {} in {:?}",
            va,
            evicted_va,
            candidate
        );
        true
    }
}
