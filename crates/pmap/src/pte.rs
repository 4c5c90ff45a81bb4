//! Hashed page table entry format.
//!
//! Each entry is two 32-bit words. The high word identifies the translation and is the one
//! the MMU checks for validity; the low word carries the real page number, the
//! reference/change bits the MMU sets, the storage attributes and the page protection.
//!
//! ```text
//!  hi: | V |           VSID (24)            | H |  API (6)  |
//!       31  30                             7  6   5        0
//!  lo: |        RPN (20)        | 000 | R | C | W I M G | 0 | PP |
//!       31                    12        8   7   6     3       1  0
//! ```

use core::fmt;

use crate::{PhysicalAddress, VirtualAddress, Vsid};

pub(crate) const PTE_VALID: u32 = 0x8000_0000;
pub(crate) const PTE_VSID_SHIFT: u32 = 7;
pub(crate) const PTE_VSID: u32 = 0x7fff_ff80;
pub(crate) const PTE_HID: u32 = 0x0000_0040;
pub(crate) const PTE_API: u32 = 0x0000_003f;

pub(crate) const PTE_RPGN: u32 = 0xffff_f000;
pub(crate) const PTE_REF: u32 = 0x0000_0100;
pub(crate) const PTE_CHG: u32 = 0x0000_0080;
pub(crate) const PTE_I: u32 = 0x0000_0020;
pub(crate) const PTE_M: u32 = 0x0000_0010;
pub(crate) const PTE_G: u32 = 0x0000_0008;
pub(crate) const PTE_PP: u32 = 0x0000_0003;

/// Supervisor read/write, user read/write.
pub(crate) const PTE_BW: u32 = 0x0000_0002;
/// Read-only for everyone.
pub(crate) const PTE_BR: u32 = 0x0000_0003;

/// A reference/change bit the MMU sets in an entry's low word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteBit {
    /// The page has been accessed.
    Reference,
    /// The page has been written.
    Change,
}

impl PteBit {
    /// The bit's mask in the low word.
    pub const fn mask(self) -> u32 {
        match self {
            Self::Reference => PTE_REF,
            Self::Change => PTE_CHG,
        }
    }
}

/// A hashed page table entry, or the mapping object's copy of one.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Pte {
    pub(crate) hi: u32,
    pub(crate) lo: u32,
}

impl Pte {
    /// Builds an invalid entry translating `va` in segment `vsid` to `pa`, with the given
    /// storage-attribute and protection bits in the low word.
    pub fn new(vsid: Vsid, va: VirtualAddress, pa: PhysicalAddress, lo_bits: u32) -> Self {
        Self {
            hi: (vsid.as_u32() << PTE_VSID_SHIFT) | va.api(),
            lo: (pa.as_usize() as u32 & PTE_RPGN) | (lo_bits & !PTE_RPGN),
        }
    }

    #[inline]
    pub const fn hi(&self) -> u32 {
        self.hi
    }

    #[inline]
    pub const fn lo(&self) -> u32 {
        self.lo
    }

    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.hi & PTE_VALID != 0
    }

    /// Returns true if the entry was placed using the secondary hash.
    #[inline]
    pub const fn is_secondary(&self) -> bool {
        self.hi & PTE_HID != 0
    }

    pub(crate) fn set_valid(&mut self) {
        self.hi |= PTE_VALID;
    }

    pub(crate) fn clear_valid(&mut self) {
        self.hi &= !PTE_VALID;
    }

    pub(crate) fn set_secondary(&mut self, secondary: bool) {
        if secondary {
            self.hi |= PTE_HID;
        } else {
            self.hi &= !PTE_HID;
        }
    }

    /// The segment identifier this entry belongs to.
    #[inline]
    pub const fn vsid(&self) -> Vsid {
        Vsid::new((self.hi & PTE_VSID) >> PTE_VSID_SHIFT)
    }

    /// The physical page this entry translates to.
    #[inline]
    pub fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new((self.lo & PTE_RPGN) as usize)
    }

    /// Returns true if this entry translates `va` in segment `vsid`, ignoring validity and
    /// the hash position.
    pub fn translates(&self, vsid: Vsid, va: VirtualAddress) -> bool {
        self.vsid() == vsid && self.hi & PTE_API == va.api()
    }

    #[inline]
    pub const fn protection_bits(&self) -> u32 {
        self.lo & PTE_PP
    }

    #[inline]
    pub const fn is_writable(&self) -> bool {
        self.lo & PTE_PP == PTE_BW
    }

    pub(crate) fn set_read_only(&mut self) {
        self.lo = (self.lo & !PTE_PP) | PTE_BR;
    }

    /// Returns true if the page is mapped cache-inhibited.
    #[inline]
    pub const fn is_cache_inhibited(&self) -> bool {
        self.lo & PTE_I != 0
    }

    #[inline]
    pub const fn has(&self, bit: PteBit) -> bool {
        self.lo & bit.mask() != 0
    }

    pub(crate) fn clear_bits(&mut self, bits: u32) {
        self.lo &= !bits;
    }

    /// Copies the reference/change bits the MMU has set in `hardware` into this entry.
    pub(crate) fn harvest(&mut self, hardware: &Pte) {
        self.lo |= hardware.lo & (PTE_REF | PTE_CHG);
    }

    /// Returns true if `hardware` holds this translation, allowing only the
    /// reference/change bits to differ.
    pub(crate) fn matches_hardware(&self, hardware: &Pte) -> bool {
        self.hi == hardware.hi && (self.lo ^ hardware.lo) & !(PTE_REF | PTE_CHG) == 0
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pte({:#010x} {:#010x} {}{}{}{}{}{} pp={})",
            self.hi,
            self.lo,
            if self.is_valid() { 'V' } else { '-' },
            if self.is_secondary() { 'H' } else { '-' },
            if self.lo & PTE_REF != 0 { 'R' } else { '-' },
            if self.lo & PTE_CHG != 0 { 'C' } else { '-' },
            if self.lo & PTE_I != 0 { 'I' } else { '-' },
            if self.lo & PTE_G != 0 { 'G' } else { '-' },
            self.lo & PTE_PP,
        )
    }
}
