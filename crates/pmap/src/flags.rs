//! Protection and enter flags.

use core::fmt;
use core::ops::BitOr;

/// Access permissions requested by the machine-independent layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Protection(u8);

impl Protection {
    /// No access
    pub const NONE: Self = Self(0);
    /// Read permission
    pub const READ: Self = Self(1 << 0);
    /// Write permission
    pub const WRITE: Self = Self(1 << 1);
    /// Execute permission
    pub const EXECUTE: Self = Self(1 << 2);

    pub const READ_WRITE: Self = Self(Self::READ.0 | Self::WRITE.0);
    pub const READ_EXECUTE: Self = Self(Self::READ.0 | Self::EXECUTE.0);
    pub const ALL: Self = Self(Self::READ.0 | Self::WRITE.0 | Self::EXECUTE.0);

    #[inline]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    #[inline]
    pub const fn is_executable(self) -> bool {
        self.0 & Self::EXECUTE.0 != 0
    }

    /// Returns true if every permission in `other` is also granted by `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Protection {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.is_readable() { 'r' } else { '-' };
        let w = if self.is_writable() { 'w' } else { '-' };
        let x = if self.is_executable() { 'x' } else { '-' };
        write!(f, "Protection({r}{w}{x})")
    }
}

/// Modifiers for [`Pmap::enter`](crate::Pmap::enter).
///
/// ```ignore
/// pmap.enter(space, va, pa, Protection::READ_WRITE, EnterFlags::empty().wired().can_fail())?;
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EnterFlags(u8);

impl EnterFlags {
    const WIRED: u8 = 1 << 0;
    const CAN_FAIL: u8 = 1 << 1;
    const NO_CACHE: u8 = 1 << 2;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// The mapping is exempt from removal by reclaim and is counted as wired.
    pub const fn wired(self) -> Self {
        Self(self.0 | Self::WIRED)
    }

    /// Report allocation failure as [`PmapError::OutOfMemory`](crate::PmapError) instead of
    /// panicking. Allocation is attempted without blocking.
    pub const fn can_fail(self) -> Self {
        Self(self.0 | Self::CAN_FAIL)
    }

    /// Map the page cache-inhibited and guarded even if it is ordinary memory.
    pub const fn no_cache(self) -> Self {
        Self(self.0 | Self::NO_CACHE)
    }

    pub const fn is_wired(self) -> bool {
        self.0 & Self::WIRED != 0
    }

    pub const fn is_can_fail(self) -> bool {
        self.0 & Self::CAN_FAIL != 0
    }

    pub const fn is_no_cache(self) -> bool {
        self.0 & Self::NO_CACHE != 0
    }
}

impl fmt::Debug for EnterFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnterFlags")
            .field("wired", &self.is_wired())
            .field("can_fail", &self.is_can_fail())
            .field("no_cache", &self.is_no_cache())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protection_combinations() {
        let prot = Protection::READ | Protection::EXECUTE;
        assert_eq!(prot, Protection::READ_EXECUTE);
        assert!(prot.is_readable());
        assert!(!prot.is_writable());
        assert!(Protection::ALL.contains(Protection::READ_WRITE));
        assert!(!prot.contains(Protection::READ_WRITE));
        assert_eq!(format!("{:?}", prot), "Protection(r-x)");
    }

    #[test]
    fn enter_flags_builder() {
        let flags = EnterFlags::empty().wired().no_cache();
        assert!(flags.is_wired());
        assert!(flags.is_no_cache());
        assert!(!flags.is_can_fail());
        assert_eq!(EnterFlags::default(), EnterFlags::empty());
    }
}
