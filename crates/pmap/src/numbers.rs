//! Page and frame number types.
//!
//! Range operations (remove, protect, unwire) walk page numbers rather than raw addresses,
//! so both types implement [`Step`] and can be used in `a..b` ranges.

use core::{
    fmt,
    iter::Step,
    ops::{Add, Sub},
};

use crate::{
    address::{PhysicalAddress, VirtualAddress},
    arch,
};

macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl Step for $name {
            fn steps_between(start: &Self, end: &Self) -> (usize, Option<usize>) {
                match end.0.checked_sub(start.0) {
                    Some(diff) => (diff, Some(diff)),
                    None => (0, None),
                }
            }

            fn forward_checked(start: Self, count: usize) -> Option<Self> {
                start.0.checked_add(count).map(Self)
            }

            fn backward_checked(start: Self, count: usize) -> Option<Self> {
                start.0.checked_sub(count).map(Self)
            }
        }
    };
}

impl_page_number_common!(
    FrameNumber,
    "A physical page frame number (the physical address shifted right by the page shift)."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self::new(addr.as_usize() >> arch::PAGE_SHIFT)
    }
}

impl_page_number_common!(
    PageNumber,
    "An effective page number (the effective address shifted right by the page shift)."
);

impl PageNumber {
    /// Returns the effective address at the start of this page.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 * arch::PAGE_SIZE)
    }

    /// Returns the page numbers covering `[start, end)`, rounding `end` up to a page boundary.
    pub fn range(start: VirtualAddress, end: VirtualAddress) -> core::ops::Range<PageNumber> {
        start.page_number()..end.align_up(arch::PAGE_SIZE).page_number()
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        Self::new(addr.as_usize() >> arch::PAGE_SHIFT)
    }
}
