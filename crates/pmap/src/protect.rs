//! Protection changes and reference/change tracking.
//!
//! Protection only ever tightens here: a range or page can lose write or execute
//! permission, or be unmapped, but regaining access takes a fresh [`Pmap::enter`].
//! Reference/change state of a managed page is the union of the bits cached on its
//! [`Frame`](crate::Frame) (saved when mappings were removed) and the bits in each live
//! mapping, which the hardware updates behind our back.

use crate::mapping::{PageChain, PvoFlags, PvoHandle};
use crate::pmap::PmapState;
use crate::port::{HardwareTlbPort, ProcessorPort};
use crate::pte::PteBit;
use crate::{
    AddressSpace, EvictionPolicy, FrameSource, PAGE_SIZE, PageAttribute, PageNumber, PageRecords,
    PhysicalAddress, Pmap, Protection, VirtualAddress,
};

fn attribute(bit: PteBit) -> PageAttribute {
    match bit {
        PteBit::Reference => PageAttribute::Referenced,
        PteBit::Change => PageAttribute::Modified,
    }
}

impl<H, F, R, E> Pmap<H, F, R, E>
where
    H: HardwareTlbPort + ProcessorPort,
    F: FrameSource,
    R: PageRecords,
    E: EvictionPolicy,
{
    /// Lowers the protection of every mapping of `space` in `[start, end)`.
    ///
    /// Without read permission this is [`remove`](Self::remove). Otherwise every mapping
    /// becomes read-only, and loses execute permission unless `prot` has it.
    pub fn protect(
        &self,
        space: AddressSpace,
        start: VirtualAddress,
        end: VirtualAddress,
        prot: Protection,
    ) {
        if !prot.is_readable() {
            self.remove(space, start, end);
            return;
        }

        let mut state = self.lock();
        for page in PageNumber::range(start, end) {
            if let Some(handle) = state.lookup(space, page.start()) {
                state.demote(&self.hw, handle, prot);
            }
        }
    }

    /// Lowers the protection of every mapping of the physical page containing `pa`.
    ///
    /// Without read permission, unwired mappings are removed and wired ones are made
    /// read-only. Asking for read/write access changes nothing.
    pub fn page_protect(&self, pa: PhysicalAddress, prot: Protection) {
        if prot.contains(Protection::READ_WRITE) {
            return;
        }
        let pa = pa.align_down(PAGE_SIZE);
        let chain = match self.records.record(pa) {
            Some(frame) => PageChain::Managed(frame),
            None => PageChain::Unmanaged,
        };

        let mut state = self.lock();
        let mut next = state.store.page_head(&chain);
        while let Some(handle) = next {
            next = state.store.next_on_page(handle);
            let pvo = state.store.get(handle);
            if pvo.physical_address() != pa {
                continue;
            }
            if !prot.is_readable() && !pvo.is_wired() {
                state.pvo_remove(&self.hw, &self.records, handle);
            } else {
                state.demote(&self.hw, handle, prot);
            }
        }
    }

    /// Returns whether any mapping of the managed page containing `pa` has set `bit`, past
    /// or present. Unmanaged pages always report false.
    pub fn query_bit(&self, pa: PhysicalAddress, bit: PteBit) -> bool {
        let Some(frame) = self.records.record(pa) else {
            return false;
        };
        let attribute = attribute(bit);
        if frame.test(attribute) {
            return true;
        }

        let mut state = self.lock();
        let chain = PageChain::Managed(frame);
        if state.store.page(&chain).any(|(_, pvo)| pvo.pte.has(bit)) {
            frame.test_and_set(attribute);
            return true;
        }

        self.hw.sync_local();
        let mut next = state.store.page_head(&chain);
        while let Some(handle) = next {
            next = state.store.next_on_page(handle);
            state.synchronize(handle);
            if state.store.get(handle).pte.has(bit) {
                frame.test_and_set(attribute);
                return true;
            }
        }
        false
    }

    /// Clears `bit` on the managed page containing `pa`: in its cached history, in every
    /// mapping and in every live hardware entry. Returns whether the bit was set.
    ///
    /// Clearing the change bit of a page that was modified also forgets that the page is
    /// coherent with the instruction cache.
    pub fn clear_bit(&self, pa: PhysicalAddress, bit: PteBit) -> bool {
        let Some(frame) = self.records.record(pa) else {
            return false;
        };
        let attribute = attribute(bit);
        let mut was_set = frame.test(attribute);
        frame.clear(attribute);

        let mut guard = self.lock();
        let state = &mut *guard;
        let chain = PageChain::Managed(frame);
        self.hw.sync_local();
        let mut next = state.store.page_head(&chain);
        while let Some(handle) = next {
            next = state.store.next_on_page(handle);
            if let Some(slot) = state.resident_slot(handle) {
                let pvo = state.store.get_mut(handle);
                if !pvo.pte.has(bit) {
                    state.table.synchronize(slot, &mut pvo.pte);
                }
                if pvo.pte.has(bit) {
                    state.table.clear_bits(&self.hw, slot, pvo.va, bit.mask());
                }
            }
            let pvo = state.store.get_mut(handle);
            was_set |= pvo.pte.has(bit);
            pvo.pte.clear_bits(bit.mask());
        }

        if bit == PteBit::Change && was_set && frame.test(PageAttribute::Executable) {
            frame.clear(PageAttribute::Executable);
        }
        was_set
    }

    pub fn is_referenced(&self, pa: PhysicalAddress) -> bool {
        self.query_bit(pa, PteBit::Reference)
    }

    pub fn is_modified(&self, pa: PhysicalAddress) -> bool {
        self.query_bit(pa, PteBit::Change)
    }

    pub fn clear_reference(&self, pa: PhysicalAddress) -> bool {
        self.clear_bit(pa, PteBit::Reference)
    }

    pub fn clear_modify(&self, pa: PhysicalAddress) -> bool {
        self.clear_bit(pa, PteBit::Change)
    }
}

impl PmapState {
    /// Makes one mapping read-only, dropping execute permission unless `prot` keeps it, and
    /// rewrites its live entry if it is resident.
    fn demote<H: HardwareTlbPort + ?Sized>(&mut self, hw: &H, handle: PvoHandle, prot: Protection) {
        let slot = self.resident_slot(handle);
        let pvo = self.store.get_mut(handle);
        if !prot.is_executable() {
            pvo.flags.set(PvoFlags::EXECUTABLE, false);
        }
        if !pvo.pte.is_writable() {
            return;
        }
        pvo.pte.set_read_only();
        if let Some(slot) = slot {
            self.table.change(hw, slot, &mut pvo.pte, pvo.va);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, cached_pa, managed_pa, tlb_events, user_va};
    use crate::{EnterFlags, TlbEvent};

    #[test]
    fn protection_only_tightens() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let va = user_va(0x1000);
        pmap.enter(space, va, managed_pa(0), Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();

        pmap.protect(space, va, va + PAGE_SIZE, Protection::READ);
        assert_eq!(pmap.find(space, va).unwrap().protection, Protection::READ);
        pmap.protect(space, va, va + PAGE_SIZE, Protection::READ_WRITE);
        assert_eq!(pmap.find(space, va).unwrap().protection, Protection::READ);
        pmap.verify();
    }

    #[test]
    fn protect_rewrites_live_entry_in_order() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let va = user_va(0x1000);
        pmap.enter(space, va, managed_pa(0), Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        assert!(pmap.record_access(space, va, true));
        pmap.hardware().take_events();

        pmap.protect(space, va, va + PAGE_SIZE, Protection::READ);
        assert_eq!(
            tlb_events(pmap.hardware()),
            vec![
                TlbEvent::SyncLocal,
                TlbEvent::SyncLocal,
                TlbEvent::Invalidate(va),
                TlbEvent::SyncGlobal,
                TlbEvent::SyncLocal,
                TlbEvent::SyncLocal,
            ]
        );
        let mapping = pmap.find(space, va).unwrap();
        assert!(mapping.resident.is_some());
        assert!(mapping.modified, "history survives the rewrite");
        pmap.verify();
    }

    #[test]
    fn protect_without_read_removes() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let va = user_va(0x1000);
        pmap.enter(space, va, managed_pa(0), Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        pmap.protect(space, va, va + PAGE_SIZE, Protection::NONE);
        assert_eq!(pmap.extract(space, va), None);
    }

    #[test]
    fn protect_drops_execute_unless_kept() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let va = user_va(0x1000);
        pmap.enter(space, va, cached_pa(0), Protection::ALL, EnterFlags::empty())
            .unwrap();
        pmap.protect(space, va, va + PAGE_SIZE, Protection::READ_EXECUTE);
        assert_eq!(pmap.find(space, va).unwrap().protection, Protection::READ_EXECUTE);
        pmap.protect(space, va, va + PAGE_SIZE, Protection::READ);
        assert_eq!(pmap.find(space, va).unwrap().protection, Protection::READ);
    }

    #[test]
    fn page_protect_exempts_wired_mappings() {
        let pmap = testing::pmap(16);
        let a = pmap.create();
        let b = pmap.create();
        let pa = managed_pa(1);
        pmap.enter(a, user_va(0x1000), pa, Protection::READ_WRITE, EnterFlags::empty().wired())
            .unwrap();
        pmap.enter(b, user_va(0x2000), pa, Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();

        pmap.page_protect(pa, Protection::NONE);
        assert_eq!(pmap.extract(b, user_va(0x2000)), None);
        let wired = pmap.find(a, user_va(0x1000)).unwrap();
        assert!(wired.wired);
        assert_eq!(wired.protection, Protection::READ);
        assert_eq!(pmap.mappings_of(pa).len(), 1);
        pmap.verify();
    }

    #[test]
    fn page_protect_read_only_demotes_every_space() {
        let pmap = testing::pmap(16);
        let a = pmap.create();
        let b = pmap.create();
        let pa = managed_pa(2);
        for space in [a, b] {
            pmap.enter(space, user_va(0x1000), pa, Protection::READ_WRITE, EnterFlags::empty())
                .unwrap();
        }
        pmap.page_protect(pa, Protection::READ_WRITE);
        assert!(pmap.mappings_of(pa).iter().all(|m| m.protection == Protection::READ_WRITE));

        pmap.page_protect(pa, Protection::READ);
        let mappings = pmap.mappings_of(pa);
        assert_eq!(mappings.len(), 2);
        assert!(mappings.iter().all(|m| m.protection == Protection::READ));
        pmap.verify();
    }

    #[test]
    fn page_protect_on_unmanaged_page_only_touches_that_page() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let device = PhysicalAddress::new(0xf000_0000);
        let other = PhysicalAddress::new(0xf000_1000);
        pmap.enter(space, user_va(0x1000), device, Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        pmap.enter(space, user_va(0x2000), other, Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        pmap.page_protect(device, Protection::NONE);
        assert_eq!(pmap.extract(space, user_va(0x1000)), None);
        assert_eq!(pmap.extract(space, user_va(0x2000)), Some(other));
    }

    #[test]
    fn reference_bit_outlives_the_mapping() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let va = user_va(0x1000);
        let pa = managed_pa(3);
        pmap.enter(space, va, pa, Protection::READ, EnterFlags::empty())
            .unwrap();
        assert!(!pmap.is_referenced(pa));

        assert!(pmap.record_access(space, va, false));
        pmap.remove(space, va, va + PAGE_SIZE);
        assert!(pmap.mappings_of(pa).is_empty());
        assert!(pmap.query_bit(pa, PteBit::Reference));
        assert!(!pmap.query_bit(pa, PteBit::Change));
    }

    #[test]
    fn query_bit_reads_live_hardware_bits() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let va = user_va(0x1000);
        let pa = managed_pa(4);
        pmap.enter(space, va, pa, Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        assert!(!pmap.is_modified(pa));
        assert!(pmap.record_access(space, va, true));
        assert!(pmap.is_modified(pa));
        assert!(pmap.is_referenced(pa));
    }

    #[test]
    fn clear_bit_clears_cache_copies_and_hardware() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let va = user_va(0x1000);
        let pa = managed_pa(5);
        pmap.enter(space, va, pa, Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        assert!(pmap.record_access(space, va, true));
        assert!(pmap.is_modified(pa));

        assert!(pmap.clear_modify(pa));
        assert!(!pmap.is_modified(pa));
        assert!(pmap.is_referenced(pa));
        assert!(!pmap.clear_modify(pa));
        let mapping = pmap.find(space, va).unwrap();
        assert!(!mapping.modified);
        assert!(mapping.referenced);

        assert!(pmap.clear_reference(pa));
        assert!(!pmap.is_referenced(pa));
        pmap.verify();
    }

    #[test]
    fn clearing_modify_forgets_icache_coherence() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let pa = cached_pa(1);
        pmap.enter(space, user_va(0x1000), pa, Protection::ALL, EnterFlags::empty())
            .unwrap();
        assert!(pmap.record_access(space, user_va(0x1000), true));
        assert!(pmap.clear_modify(pa));
        pmap.hardware().take_events();

        pmap.enter(space, user_va(0x2000), pa, Protection::READ_EXECUTE, EnterFlags::empty())
            .unwrap();
        assert!(
            pmap.hardware()
                .take_events()
                .iter()
                .any(|event| matches!(event, TlbEvent::SyncIcache(..)))
        );
    }

    #[test]
    fn unmanaged_pages_have_no_history() {
        let pmap = testing::pmap(16);
        let device = PhysicalAddress::new(0xf000_0000);
        assert!(!pmap.query_bit(device, PteBit::Change));
        assert!(!pmap.clear_bit(device, PteBit::Change));
    }

    #[test]
    fn end_to_end() {
        let pmap = testing::pmap(16);
        let space = pmap.create();
        let va = user_va(0x1000);
        let pa = PhysicalAddress::new(0x8000_0000);

        pmap.enter(space, va, pa, Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        assert_eq!(pmap.extract(space, va), Some(pa));
        pmap.protect(space, va, user_va(0x2000), Protection::READ);
        assert!(!pmap.query_bit(pa, PteBit::Change));
        pmap.remove(space, va, user_va(0x2000));
        assert_eq!(pmap.extract(space, va), None);
        pmap.verify();
        pmap.destroy(space);
    }
}
