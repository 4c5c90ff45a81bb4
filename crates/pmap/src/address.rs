//! Address types for physical and effective memory.
//!
//! This module provides wrappers around physical and effective (virtual) addresses, with
//! the accessors the hashed MMU needs: segment register number, page index and the
//! abbreviated page index stored in a page table entry.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch::{self, ADDR_API_SHIFT, ADDR_PIDX, PAGE_SHIFT, SEGMENT_SHIFT};
use crate::{FrameNumber, PageNumber};

#[cfg(any(test, feature = "software-emulation", not(target_arch = "powerpc")))]
use crate::arch::EmulatedMemory;

/// Address translator for reaching physical memory from the kernel.
///
/// This enum supports two modes:
/// - Hardware: physical memory is mapped at a fixed offset (zero when running with block
///   address translation covering low memory)
/// - Emulated: physical memory is a host buffer (testing mode)
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation", not(target_arch = "powerpc")))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a new emulated translator with the given memory size.
    #[cfg(any(test, feature = "software-emulation", not(target_arch = "powerpc")))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Sets the global address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation", not(target_arch = "powerpc"))))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation", not(target_arch = "powerpc")))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns a reference to the current global address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has not been set yet.
    pub fn current() -> &'static AddressTranslator {
        Self::try_current().expect(
            "address translator not set; call AddressTranslator::set_current during initialization",
        )
    }

    /// Returns a reference to the current global address translator if it has been set.
    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation", not(target_arch = "powerpc"))))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation", not(target_arch = "powerpc")))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                // SAFETY: Each thread owns its translator, it is never replaced once set, and
                // the thread-local outlives every borrow taken on that thread.
                t.get()
                    .map(|translator| unsafe { &*(translator as *const AddressTranslator) })
            })
        }
    }

    /// Translates a physical address to a kernel-accessible virtual address.
    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation", not(target_arch = "powerpc")))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    /// Translates a kernel-accessible virtual address back to a physical address.
    pub fn virt_to_phys(&self, virt: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => virt.wrapping_sub(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation", not(target_arch = "powerpc")))]
            Self::Emulated(mem) => mem.ptr_to_phys(virt as *const u8),
        }
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: usize) -> *mut T {
        self.phys_to_virt(phys) as *mut T
    }

    fn is_emulated(&self) -> bool {
        match self {
            Self::Hardware { .. } => false,
            #[cfg(any(test, feature = "software-emulation", not(target_arch = "powerpc")))]
            Self::Emulated(_) => true,
        }
    }
}

#[cfg(not(any(test, feature = "software-emulation", not(target_arch = "powerpc"))))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation", not(target_arch = "powerpc")))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }

            /// Returns the byte offset within the page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(addr: u32) -> Self {
                Self::new(addr as usize)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Physical addresses on 32-bit OEA processors are 32 bits wide; the page frame number\n\
     occupies the upper 20 bits."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Converts a kernel-accessible pointer back to the physical address it maps.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been set via [`AddressTranslator::set_current`].
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::new(AddressTranslator::current().virt_to_phys(ptr as usize))
    }

    /// Returns a kernel-accessible pointer to this physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been set via [`AddressTranslator::set_current`].
    #[inline]
    pub fn to_ptr<T>(self) -> *mut T {
        AddressTranslator::current().phys_to_ptr(self.0)
    }

    /// Returns the corresponding frame number for this physical address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "An effective (virtual) memory address.\n\n\
     The top four bits select a segment register, the next sixteen are the page index\n\
     within the segment, and the low twelve are the byte offset within the page."
);

impl VirtualAddress {
    /// Creates a new effective address.
    ///
    /// # Panics
    ///
    /// Panics if the address does not fit in 32 bits.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_virtual(addr),
            "effective address exceeds 32 bits"
        );
        Self(addr)
    }

    /// Creates an address from a host pointer.
    ///
    /// In emulated mode host pointers do not fit the guest's 32-bit address space, so
    /// validation is bypassed.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        if AddressTranslator::try_current().is_some_and(|t| t.is_emulated()) {
            return Self(ptr as usize);
        }
        Self::new(ptr as usize)
    }

    /// Returns the segment register number covering this address.
    #[inline]
    pub const fn segment(self) -> usize {
        (self.0 >> SEGMENT_SHIFT) & (arch::SEGMENT_COUNT - 1)
    }

    /// Returns the page index within the segment (16 bits), the input to the hash.
    #[inline]
    pub const fn page_index(self) -> usize {
        (self.0 & ADDR_PIDX) >> PAGE_SHIFT
    }

    /// Returns the abbreviated page index: the top six bits of the page index.
    #[inline]
    pub const fn api(self) -> u32 {
        ((self.0 >> ADDR_API_SHIFT) & 0x3f) as u32
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Gets the corresponding page number for this address.
    #[inline]
    pub fn page_number(self) -> PageNumber {
        PageNumber::from(self)
    }
}
