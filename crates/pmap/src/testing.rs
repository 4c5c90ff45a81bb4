//! Shared fixtures for the manager's unit tests.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::memmap::tests::TestRegion;
use crate::{
    AddressTranslator, BlockAllocator, EmulatedMmu, EvictionPolicy, MemoryMap, PAGE_SIZE,
    PhysicalAddress, Pmap, PmapConfig, TlbEvent, VM_MIN_KERNEL_ADDRESS, VirtualAddress,
};

/// Size of the emulated physical memory each test thread gets.
pub(crate) const EMULATED_MEMORY: usize = 1024 * 1024;

/// Managed pages outside boot memory, mapped cache-inhibited.
const MANAGED_BASE: usize = 0x8000_0000;
const MANAGED_PAGES: usize = 64;

/// Managed pages inside boot memory, mapped cacheable.
const CACHED_BASE: usize = EMULATED_MEMORY - 16 * PAGE_SIZE;

pub(crate) type TestPmap = Pmap<EmulatedMmu, &'static BlockAllocator, &'static MemoryMap>;

fn translator() {
    if AddressTranslator::try_current().is_none() {
        AddressTranslator::set_current(AddressTranslator::emulated(EMULATED_MEMORY));
    }
}

fn boot_memory() -> &'static BlockAllocator {
    let boot = Box::leak(Box::new(BlockAllocator::new()));
    if let Err(err) = boot.add(PhysicalAddress::new(0), EMULATED_MEMORY) {
        panic!("cannot seed boot memory: {:?}", err);
    }
    boot
}

fn records() -> &'static MemoryMap {
    let regions = [
        TestRegion {
            base: MANAGED_BASE,
            size: MANAGED_PAGES * PAGE_SIZE,
            usable: true,
        },
        TestRegion {
            base: CACHED_BASE,
            size: EMULATED_MEMORY - CACHED_BASE,
            usable: true,
        },
    ];
    Box::leak(Box::new(MemoryMap::from_boot_map(&regions)))
}

/// A manager over emulated memory with a table of `groups` groups.
pub(crate) fn pmap(groups: usize) -> TestPmap {
    pmap_with(PmapConfig {
        pteg_count: Some(groups),
        ..PmapConfig::default()
    })
}

pub(crate) fn pmap_with(config: PmapConfig) -> TestPmap {
    translator();
    let boot = boot_memory();
    Pmap::bootstrap(EmulatedMmu::new(), boot, boot, records(), config)
}

pub(crate) fn pmap_with_eviction<E: EvictionPolicy>(
    config: PmapConfig,
    eviction: E,
) -> Pmap<EmulatedMmu, &'static BlockAllocator, &'static MemoryMap, E> {
    translator();
    let boot = boot_memory();
    Pmap::bootstrap_with_eviction(EmulatedMmu::new(), boot, boot, records(), config, eviction)
}

/// A manager whose frame source never has memory for mapping objects.
pub(crate) fn starved_pmap() -> TestPmap {
    translator();
    let boot = boot_memory();
    let empty: &'static BlockAllocator = Box::leak(Box::new(BlockAllocator::new()));
    Pmap::bootstrap(
        EmulatedMmu::new(),
        boot,
        empty,
        records(),
        PmapConfig {
            pteg_count: Some(16),
            ..PmapConfig::default()
        },
    )
}

/// A manager whose mapping objects must all fit in one frame.
pub(crate) fn single_frame_pmap() -> TestPmap {
    translator();
    let boot = boot_memory();
    let page = PhysicalAddress::new(CACHED_BASE - PAGE_SIZE);
    let frames: &'static BlockAllocator = Box::leak(Box::new(BlockAllocator::new()));
    if let Err(err) = boot
        .reserve(page, PAGE_SIZE)
        .and_then(|()| frames.add(page, PAGE_SIZE))
    {
        panic!("cannot set aside the pool frame: {:?}", err);
    }
    Pmap::bootstrap(
        EmulatedMmu::new(),
        boot,
        frames,
        records(),
        PmapConfig {
            pteg_count: Some(16),
            ..PmapConfig::default()
        },
    )
}

/// Drains recorded events, dropping interrupt masking so only table maintenance remains.
pub(crate) fn tlb_events(hw: &EmulatedMmu) -> Vec<TlbEvent> {
    hw.take_events()
        .into_iter()
        .filter(|event| {
            !matches!(
                event,
                TlbEvent::InterruptsDisabled | TlbEvent::InterruptsRestored
            )
        })
        .collect()
}

pub(crate) fn user_va(addr: usize) -> VirtualAddress {
    VirtualAddress::new(addr)
}

pub(crate) fn kernel_va(offset: usize) -> VirtualAddress {
    VirtualAddress::new(VM_MIN_KERNEL_ADDRESS + offset)
}

/// The `index`th managed page that is not ordinary memory.
pub(crate) fn managed_pa(index: usize) -> PhysicalAddress {
    assert!(index < MANAGED_PAGES, "fixture has {} managed pages", MANAGED_PAGES);
    PhysicalAddress::new(MANAGED_BASE + index * PAGE_SIZE)
}

/// The `index`th managed page of ordinary, cacheable memory.
pub(crate) fn cached_pa(index: usize) -> PhysicalAddress {
    PhysicalAddress::new(CACHED_BASE + index * PAGE_SIZE)
}
