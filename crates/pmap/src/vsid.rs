//! Segment identifier allocation.
//!
//! Every address space owns one 20-bit [`SegmentId`]. The sixteen virtual segment
//! identifiers ([`Vsid`]) it loads into the segment registers are derived from it by
//! appending the segment register number, so two spaces never share a hash tag.
//!
//! Allocation probes a bitmap with a multiplicative congruential sequence seeded from the
//! time base. Sequential identifiers would cluster in the hashed table; scattering them
//! spreads every space's pages over the whole table.

use alloc::boxed::Box;
use alloc::vec;
use core::fmt;

use crate::SEGMENT_COUNT;

const VSID_NBPW: u32 = u32::BITS;
const SEGMENT_ID_MASK: u32 = 0x000f_ffff;

/// A virtual segment identifier: the tag the MMU hashes and stores in every entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Vsid(u32);

impl Vsid {
    /// Identifiers are 24 bits wide.
    pub const MASK: u32 = 0x00ff_ffff;

    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw & Self::MASK)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Whether this identifier belongs to one of the kernel's segments.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >> 4 == SegmentId::KERNEL.0
    }
}

impl fmt::Debug for Vsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vsid({:#08x})", self.0)
    }
}

/// The per-address-space identifier handed out by [`VsidAllocator`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SegmentId(u32);

impl SegmentId {
    /// Reserved for the kernel address space.
    pub const KERNEL: Self = Self(SEGMENT_ID_MASK);

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Derives the identifier for segment register `segment`.
    #[inline]
    pub const fn vsid(self, segment: usize) -> Vsid {
        assert!(segment < SEGMENT_COUNT, "segment register out of range");
        Vsid::new((self.0 << 4) | segment as u32)
    }

    /// Derives the identifiers for every segment register.
    pub fn segments(self) -> [Vsid; SEGMENT_COUNT] {
        core::array::from_fn(|segment| self.vsid(segment))
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({:#07x})", self.0)
    }
}

/// Bitmap allocator for [`SegmentId`]s.
pub struct VsidAllocator {
    bitmap: Box<[u32]>,
    context: u32,
    live: usize,
}

impl VsidAllocator {
    /// Creates an allocator able to track `capacity` address spaces, with identifier zero and
    /// the kernel's identifier already taken.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two of at least 32.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= VSID_NBPW as usize,
            "identifier capacity must be a power of two of at least 32"
        );
        assert!(capacity <= 1 << 20, "identifier capacity exceeds the identifier width");
        let mut allocator = Self {
            bitmap: vec![0; capacity / VSID_NBPW as usize].into_boxed_slice(),
            context: 1,
            live: 0,
        };
        allocator.mark(0);
        allocator.mark(SegmentId::KERNEL.0);
        allocator
    }

    /// Number of address spaces the bitmap can track.
    pub fn capacity(&self) -> usize {
        self.bitmap.len() * VSID_NBPW as usize
    }

    /// Number of identifiers currently handed out, not counting the reserved ones.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Allocates a fresh identifier, mixing `entropy` (normally the time base) into the probe
    /// sequence.
    ///
    /// # Panics
    ///
    /// Panics with "out of segment identifiers" if no free identifier is found within one
    /// probe per bitmap word.
    pub fn allocate(&mut self, entropy: u32) -> SegmentId {
        let mask = self.capacity() as u32 - 1;
        let mut entropy = entropy;

        for _ in 0..self.bitmap.len() {
            self.context = self.context.wrapping_mul(0x1105).wrapping_add(entropy);
            let hash = self.context & mask;
            if hash == 0 {
                entropy = entropy.wrapping_add(1);
                continue;
            }

            let word = (hash / VSID_NBPW) as usize;
            let mut bit = hash % VSID_NBPW;
            let mut id = self.context & SEGMENT_ID_MASK;

            if self.bitmap[word] & (1 << bit) != 0 {
                if self.bitmap[word] == u32::MAX {
                    // Word is full; perturb the sequence and probe elsewhere.
                    entropy = self.context >> 20;
                    continue;
                }
                bit = (!self.bitmap[word]).trailing_zeros();
                id = (id & !(VSID_NBPW - 1)) | bit;
            }

            self.bitmap[word] |= 1 << bit;
            self.live += 1;
            return SegmentId(id);
        }

        panic!("out of segment identifiers");
    }

    /// Returns `id` to the pool.
    ///
    /// # Panics
    ///
    /// Panics if `id` is reserved or is not currently allocated.
    pub fn release(&mut self, id: SegmentId) {
        let position = self.position(id.0);
        assert!(
            position != 0 && position != self.position(SegmentId::KERNEL.0),
            "cannot release a reserved segment identifier"
        );
        let (word, bit) = Self::split(position);
        assert!(
            self.bitmap[word] & (1 << bit) != 0,
            "releasing segment identifier {:?} that is not allocated",
            id
        );
        self.bitmap[word] &= !(1 << bit);
        self.live -= 1;
    }

    fn mark(&mut self, id: u32) {
        let (word, bit) = Self::split(self.position(id));
        self.bitmap[word] |= 1 << bit;
    }

    fn position(&self, id: u32) -> u32 {
        id & (self.capacity() as u32 - 1)
    }

    fn split(position: u32) -> (usize, u32) {
        ((position / VSID_NBPW) as usize, position % VSID_NBPW)
    }
}
