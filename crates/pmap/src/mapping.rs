//! The mapping store.
//!
//! Every translation is a *physical-to-virtual object* (PVO): the authoritative software
//! record of one `(address space, page)` mapping. The hardware table is only a cache of
//! these, so a PVO exists whether or not its entry is currently resident.
//!
//! Each PVO is on two doubly-linked chains at once, threaded through handles rather than
//! pointers:
//!
//! - the chain of its primary hash bucket, searched by address lookups and by the spill
//!   handler;
//! - the chain of its physical page (on the page's [`Frame`] record for managed pages, or
//!   the single unmanaged chain), walked by page-wide protection and R/C operations.

use alloc::boxed::Box;
use alloc::vec;
use core::fmt;

use crate::page_table::{HashPosition, PteSlot};
use crate::pmap::PmapError;
use crate::pool::PvoPool;
use crate::pte::{PTE_BR, PTE_BW, Pte, PteBit};
use crate::{AddressSpace, AllocMode, Frame, FrameSource, PhysicalAddress, Protection, VirtualAddress};

/// Stable reference to a PVO in the pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PvoHandle(u32);

impl PvoHandle {
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub(crate) const fn into_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PvoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PvoHandle({})", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct PvoFlags(u8);

impl PvoFlags {
    pub(crate) const WIRED: u8 = 1 << 0;
    pub(crate) const MANAGED: u8 = 1 << 1;
    pub(crate) const EXECUTABLE: u8 = 1 << 2;

    pub(crate) const fn empty() -> Self {
        Self(0)
    }

    pub(crate) const fn with(self, bit: u8, on: bool) -> Self {
        if on { Self(self.0 | bit) } else { Self(self.0 & !bit) }
    }

    pub(crate) const fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub(crate) fn set(&mut self, bit: u8, on: bool) {
        *self = self.with(bit, on);
    }
}

#[derive(Clone, Copy, Default)]
struct Links {
    prev: Option<PvoHandle>,
    next: Option<PvoHandle>,
}

/// A physical-to-virtual mapping object.
#[derive(Clone, Copy)]
pub(crate) struct Pvo {
    pub(crate) space: AddressSpace,
    /// Page-aligned effective address.
    pub(crate) va: VirtualAddress,
    /// The entry as it should appear in the hardware table, plus the R/C bits harvested so
    /// far. Valid exactly when the PVO is resident.
    pub(crate) pte: Pte,
    /// Where the entry lives while resident.
    pub(crate) slot: Option<PteSlot>,
    pub(crate) flags: PvoFlags,
    /// Primary hash bucket; the chain this PVO is on.
    pub(crate) bucket: usize,
    bucket_links: Links,
    page_links: Links,
}

impl Pvo {
    pub(crate) fn new(
        space: AddressSpace,
        va: VirtualAddress,
        pte: Pte,
        flags: PvoFlags,
        bucket: usize,
    ) -> Self {
        Self {
            space,
            va,
            pte,
            slot: None,
            flags,
            bucket,
            bucket_links: Links::default(),
            page_links: Links::default(),
        }
    }

    pub(crate) fn is_wired(&self) -> bool {
        self.flags.contains(PvoFlags::WIRED)
    }

    pub(crate) fn is_managed(&self) -> bool {
        self.flags.contains(PvoFlags::MANAGED)
    }

    pub(crate) fn is_executable(&self) -> bool {
        self.flags.contains(PvoFlags::EXECUTABLE)
    }

    pub(crate) fn physical_address(&self) -> PhysicalAddress {
        self.pte.physical_address()
    }

    pub(crate) fn position(&self) -> HashPosition {
        if self.pte.is_secondary() {
            HashPosition::Secondary
        } else {
            HashPosition::Primary
        }
    }

    pub(crate) fn protection(&self) -> Protection {
        let mut prot = match self.pte.protection_bits() {
            PTE_BW => Protection::READ_WRITE,
            PTE_BR => Protection::READ,
            _ => Protection::NONE,
        };
        if self.is_executable() {
            prot = prot | Protection::EXECUTE;
        }
        prot
    }
}

/// A snapshot of one mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub space: AddressSpace,
    pub va: VirtualAddress,
    pub pa: PhysicalAddress,
    pub protection: Protection,
    pub wired: bool,
    pub managed: bool,
    /// Whether the mapping is usable by the processor without a spill: where it currently
    /// sits in the hashed table, and by which hash.
    pub resident: Option<(PteSlot, HashPosition)>,
    pub referenced: bool,
    pub modified: bool,
    pub cache_inhibited: bool,
}

impl Mapping {
    pub(crate) fn from_pvo(pvo: &Pvo) -> Self {
        Self {
            space: pvo.space,
            va: pvo.va,
            pa: pvo.physical_address(),
            protection: pvo.protection(),
            wired: pvo.is_wired(),
            managed: pvo.is_managed(),
            resident: pvo.slot.map(|slot| (slot, pvo.position())),
            referenced: pvo.pte.has(PteBit::Reference),
            modified: pvo.pte.has(PteBit::Change),
            cache_inhibited: pvo.pte.is_cache_inhibited(),
        }
    }
}

/// The physical-page chain a PVO belongs on.
pub(crate) enum PageChain<'a> {
    Managed(&'a Frame),
    Unmanaged,
}

pub(crate) struct MappingStore {
    pool: PvoPool,
    buckets: Box<[Option<PvoHandle>]>,
    unmanaged: Option<PvoHandle>,
}

impl MappingStore {
    pub(crate) fn new(buckets: usize) -> Self {
        Self {
            pool: PvoPool::new(),
            buckets: vec![None; buckets].into_boxed_slice(),
            unmanaged: None,
        }
    }

    /// Number of live PVOs.
    pub(crate) fn len(&self) -> usize {
        self.pool.live()
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn get(&self, handle: PvoHandle) -> &Pvo {
        self.pool.get(handle)
    }

    pub(crate) fn get_mut(&mut self, handle: PvoHandle) -> &mut Pvo {
        self.pool.get_mut(handle)
    }

    /// Stores a new PVO and links it at the head of its bucket and page chains.
    pub(crate) fn insert<F: FrameSource + ?Sized>(
        &mut self,
        pvo: Pvo,
        chain: &PageChain<'_>,
        frames: &F,
        mode: AllocMode,
    ) -> Result<PvoHandle, PmapError> {
        let bucket = pvo.bucket;
        let handle = self.pool.insert(pvo, frames, mode)?;

        let bucket_head = self.buckets[bucket].replace(handle);
        if let Some(next) = bucket_head {
            self.pool.get_mut(next).bucket_links.prev = Some(handle);
        }
        let page_head = self.page_head(chain);
        if let Some(next) = page_head {
            self.pool.get_mut(next).page_links.prev = Some(handle);
        }
        self.set_page_head(chain, Some(handle));

        let pvo = self.pool.get_mut(handle);
        pvo.bucket_links = Links {
            prev: None,
            next: bucket_head,
        };
        pvo.page_links = Links {
            prev: None,
            next: page_head,
        };
        Ok(handle)
    }

    /// Unlinks a PVO from both chains and frees its storage.
    pub(crate) fn remove(&mut self, handle: PvoHandle, chain: &PageChain<'_>) -> Pvo {
        let pvo = *self.pool.get(handle);

        match pvo.bucket_links.prev {
            Some(prev) => self.pool.get_mut(prev).bucket_links.next = pvo.bucket_links.next,
            None => self.buckets[pvo.bucket] = pvo.bucket_links.next,
        }
        if let Some(next) = pvo.bucket_links.next {
            self.pool.get_mut(next).bucket_links.prev = pvo.bucket_links.prev;
        }

        match pvo.page_links.prev {
            Some(prev) => self.pool.get_mut(prev).page_links.next = pvo.page_links.next,
            None => self.set_page_head(chain, pvo.page_links.next),
        }
        if let Some(next) = pvo.page_links.next {
            self.pool.get_mut(next).page_links.prev = pvo.page_links.prev;
        }

        self.pool.remove(handle)
    }

    pub(crate) fn page_head(&self, chain: &PageChain<'_>) -> Option<PvoHandle> {
        match chain {
            PageChain::Managed(frame) => frame.mappings(),
            PageChain::Unmanaged => self.unmanaged,
        }
    }

    fn set_page_head(&mut self, chain: &PageChain<'_>, head: Option<PvoHandle>) {
        match chain {
            PageChain::Managed(frame) => frame.set_mappings(head),
            PageChain::Unmanaged => self.unmanaged = head,
        }
    }

    pub(crate) fn bucket_head(&self, bucket: usize) -> Option<PvoHandle> {
        self.buckets[bucket]
    }

    pub(crate) fn next_on_page(&self, handle: PvoHandle) -> Option<PvoHandle> {
        self.pool.get(handle).page_links.next
    }

    /// Iterates a bucket chain.
    pub(crate) fn bucket(&self, bucket: usize) -> Chain<'_> {
        Chain {
            store: self,
            next: self.bucket_head(bucket),
            by_page: false,
        }
    }

    /// Iterates a physical page chain.
    pub(crate) fn page(&self, chain: &PageChain<'_>) -> Chain<'_> {
        Chain {
            store: self,
            next: self.page_head(chain),
            by_page: true,
        }
    }

    /// Finds the PVO for `(space, va)` on the chain of `bucket`.
    pub(crate) fn find(
        &self,
        space: AddressSpace,
        va: VirtualAddress,
        bucket: usize,
    ) -> Option<PvoHandle> {
        let va = va.align_down(crate::PAGE_SIZE);
        self.bucket(bucket)
            .find(|(_, pvo)| pvo.space == space && pvo.va == va)
            .map(|(handle, _)| handle)
    }
}

/// Iterator over one chain of the mapping store.
pub(crate) struct Chain<'a> {
    store: &'a MappingStore,
    next: Option<PvoHandle>,
    by_page: bool,
}

impl<'a> Iterator for Chain<'a> {
    type Item = (PvoHandle, &'a Pvo);

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.next?;
        let pvo = self.store.get(handle);
        self.next = if self.by_page {
            pvo.page_links.next
        } else {
            pvo.bucket_links.next
        };
        Some((handle, pvo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressTranslator, BlockAllocator, PAGE_SIZE};

    fn setup() -> (MappingStore, BlockAllocator) {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(8 * PAGE_SIZE));
        }
        let frames = BlockAllocator::new();
        frames.add(PhysicalAddress::new(0), 8 * PAGE_SIZE).unwrap();
        (MappingStore::new(16), frames)
    }

    fn pvo(space: u32, va: usize, bucket: usize) -> Pvo {
        Pvo::new(
            AddressSpace::from_raw(space),
            VirtualAddress::new(va),
            Pte::default(),
            PvoFlags::empty(),
            bucket,
        )
    }

    #[test]
    fn insert_links_both_chains_at_head() {
        let (mut store, frames) = setup();
        let frame = Frame::new();
        let chain = PageChain::Managed(&frame);
        let a = store
            .insert(pvo(1, 0x1000, 3), &chain, &frames, AllocMode::Blocking)
            .unwrap();
        let b = store
            .insert(pvo(2, 0x1000, 3), &chain, &frames, AllocMode::Blocking)
            .unwrap();

        let bucket: Vec<_> = store.bucket(3).map(|(h, _)| h).collect();
        assert_eq!(bucket, vec![b, a]);
        let page: Vec<_> = store.page(&chain).map(|(h, _)| h).collect();
        assert_eq!(page, vec![b, a]);
        assert_eq!(frame.mappings(), Some(b));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn remove_from_middle_and_head() {
        let (mut store, frames) = setup();
        let chain = PageChain::Unmanaged;
        let handles: Vec<_> = (0..3)
            .map(|i| {
                store
                    .insert(pvo(1, 0x1000 * (i + 1), 5), &chain, &frames, AllocMode::Blocking)
                    .unwrap()
            })
            .collect();

        store.remove(handles[1], &chain);
        let bucket: Vec<_> = store.bucket(5).map(|(h, _)| h).collect();
        assert_eq!(bucket, vec![handles[2], handles[0]]);

        store.remove(handles[2], &chain);
        assert_eq!(store.bucket_head(5), Some(handles[0]));
        assert_eq!(store.page_head(&chain), Some(handles[0]));
        assert_eq!(store.next_on_page(handles[0]), None);

        store.remove(handles[0], &chain);
        assert_eq!(store.bucket_head(5), None);
        assert_eq!(store.page_head(&chain), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn find_matches_space_and_page() {
        let (mut store, frames) = setup();
        let chain = PageChain::Unmanaged;
        let a = store
            .insert(pvo(1, 0x4000, 2), &chain, &frames, AllocMode::Blocking)
            .unwrap();
        store
            .insert(pvo(2, 0x4000, 2), &chain, &frames, AllocMode::Blocking)
            .unwrap();
        assert_eq!(
            store.find(AddressSpace::from_raw(1), VirtualAddress::new(0x4abc), 2),
            Some(a)
        );
        assert_eq!(
            store.find(AddressSpace::from_raw(3), VirtualAddress::new(0x4000), 2),
            None
        );
    }

    #[test]
    fn protection_reflects_pte_and_exec_flag() {
        let mut object = pvo(1, 0x1000, 0);
        object.pte = Pte::new(
            crate::Vsid::new(1),
            object.va,
            PhysicalAddress::new(0x2000),
            PTE_BW,
        );
        assert_eq!(object.protection(), Protection::READ_WRITE);
        object.flags.set(PvoFlags::EXECUTABLE, true);
        object.pte.set_read_only();
        assert_eq!(object.protection(), Protection::READ_EXECUTE);
    }
}
