//! Architecture-specific implementations of the hashed MMU.
//!
//! The page table format, segment layout and identifier widths are fixed by the 32-bit
//! OEA architecture and shared by every backend. This module conditionally imports either
//! the PowerPC hardware adapter or the software emulation, based on the target
//! architecture and features.

// The PowerPC hardware adapter, for kernel builds.
#[cfg(all(target_arch = "powerpc", not(test), not(feature = "software-emulation")))]
mod powerpc;
#[cfg(all(target_arch = "powerpc", not(test), not(feature = "software-emulation")))]
pub use powerpc::*;

// Software emulation for tests, the `software-emulation` feature and hosted builds.
#[cfg(any(test, feature = "software-emulation", not(target_arch = "powerpc")))]
mod software;
#[cfg(any(test, feature = "software-emulation", not(target_arch = "powerpc")))]
pub use software::*;

/// Maximum number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in an effective address.
pub const MAX_VIRTUAL_BITS: usize = 32;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of bits in the byte offset within a page.
pub const PAGE_SHIFT: usize = 12;

/// Number of segment registers; each one covers 256 MiB of the effective address space.
pub const SEGMENT_COUNT: usize = 16;

/// Shift that extracts the segment register number from an effective address.
pub const SEGMENT_SHIFT: usize = 28;

/// The segment register that always holds the kernel's identifier, whatever space is active.
pub const KERNEL_SEGMENT: usize = 13;

/// Lowest effective address of the kernel segment.
pub const VM_MIN_KERNEL_ADDRESS: usize = KERNEL_SEGMENT << SEGMENT_SHIFT;

/// Number of page table entries in one group (PTEG).
pub const PTES_PER_GROUP: usize = 8;

/// Number of address spaces the identifier bitmap can track.
pub const VSID_CAPACITY: usize = 32768;

/// Page index bits of an effective address (the bits between the segment and the offset).
pub const ADDR_PIDX: usize = 0x0fff_f000;

/// Shift of the abbreviated page index stored in the high word of an entry.
pub const ADDR_API_SHIFT: usize = 22;

/// Validates a physical address.
///
/// Physical addresses must fit within 32 bits.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= 0xFFFF_FFFF
}

/// Validates an effective address.
///
/// Effective addresses must fit within 32 bits; there is no sign extension.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr <= 0xFFFF_FFFF
}
