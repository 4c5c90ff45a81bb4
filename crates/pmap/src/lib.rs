#![cfg_attr(not(any(test, feature = "software-emulation", not(target_arch = "powerpc"))), no_std)]
#![cfg_attr(target_arch = "powerpc", feature(asm_experimental_arch))]
#![feature(step_trait)]

//! # Polaris Hashed Page-Table Manager (PMAP)
//!
//! The machine-dependent virtual memory layer for 32-bit OEA processors (the
//! "classic" PowerPC MMU). Translations live in a single system-wide hashed page
//! table of 8-entry groups that the MMU searches on a TLB miss. This crate keeps the
//! authoritative set of mappings in software and treats the hardware table as a
//! cache of it:
//!
//! - Per-address-space segment identifiers (VSIDs) and segment register activation.
//! - A mapping store indexed both by hash bucket and by physical page.
//! - Residency management, including the spill handler that reinstalls evicted
//!   translations on a page-table miss.
//! - Protection changes and reference/change bit tracking for the paging layer.
//! - Software emulation of the MMU for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod block_allocator;
mod flags;
mod frame;
mod mapping;
mod memmap;
mod numbers;
mod page_table;
mod pmap;
mod pool;
mod port;
mod protect;
mod pte;
mod spill;
mod vsid;

#[cfg(test)]
mod testing;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, SpaceStats};
pub use block_allocator::{AllocError, BlockAllocator, BootMemory, MemoryRegion};
pub use flags::{EnterFlags, Protection};
pub use frame::{AllocMode, Frame, FrameSource, PageAttribute, PageRecords};
pub use mapping::Mapping;
pub use memmap::{BootMemoryRegion, MemoryMap};
pub use numbers::{FrameNumber, PageNumber};
pub use page_table::{HashPosition, PteSlot};
pub use pmap::{BucketDistribution, Entered, Pmap, PmapConfig, PmapError, PmapStats};
pub use port::{HardwareTlbPort, InterruptGuard, ProcessorPort};
pub use pte::{Pte, PteBit};
pub use spill::{EvictionPolicy, TimebaseEviction};
pub use vsid::{SegmentId, Vsid, VsidAllocator};

pub use arch::{KERNEL_SEGMENT, PAGE_SIZE, SEGMENT_COUNT, VM_MIN_KERNEL_ADDRESS};

#[cfg(any(test, feature = "software-emulation", not(target_arch = "powerpc")))]
pub use arch::{EmulatedMemory, EmulatedMmu, TlbEvent};

#[cfg(all(target_arch = "powerpc", not(test), not(feature = "software-emulation")))]
pub use arch::OeaMmu;
