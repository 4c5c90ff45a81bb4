//! Address space management.
//!
//! An address space is the page-table manager's view of one process (or the kernel): a set
//! of sixteen segment identifiers, a reference count and residency statistics. Its mappings
//! live in the shared mapping store, keyed by the address space handle.

use alloc::vec::Vec;
use core::fmt;

use crate::{SEGMENT_COUNT, SegmentId, Vsid};

/// Handle to an address space created by [`Pmap::create`](crate::Pmap::create).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpace(u32);

impl AddressSpace {
    /// The kernel address space, which exists from bootstrap on and is never destroyed.
    pub const KERNEL: Self = Self(0);

    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns a small integer that identifies this space while it is live.
    pub const fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::KERNEL {
            write!(f, "AddressSpace(kernel)")
        } else {
            write!(f, "AddressSpace({})", self.0)
        }
    }
}

/// Per-space mapping counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceStats {
    /// Mappings that exist in the space, whether or not their entry is in the hashed table.
    pub resident: usize,
    /// Mappings exempt from reclaim.
    pub wired: usize,
}

pub(crate) struct SpaceRecord {
    pub(crate) id: SegmentId,
    pub(crate) segments: [Vsid; SEGMENT_COUNT],
    refs: usize,
    pub(crate) stats: SpaceStats,
}

impl SpaceRecord {
    pub(crate) fn new(id: SegmentId) -> Self {
        Self {
            id,
            segments: id.segments(),
            refs: 1,
            stats: SpaceStats::default(),
        }
    }

    /// Identifier the space uses for the segment covering `segment`.
    #[inline]
    pub(crate) fn vsid(&self, segment: usize) -> Vsid {
        self.segments[segment]
    }
}

/// Slab of live address spaces. Slot zero is the kernel.
pub(crate) struct SpaceTable {
    records: Vec<Option<SpaceRecord>>,
    free: Vec<u32>,
}

impl SpaceTable {
    pub(crate) fn new(kernel: SpaceRecord) -> Self {
        let mut records = Vec::new();
        records.push(Some(kernel));
        Self {
            records,
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, record: SpaceRecord) -> AddressSpace {
        match self.free.pop() {
            Some(raw) => {
                self.records[raw as usize] = Some(record);
                AddressSpace(raw)
            }
            None => {
                self.records.push(Some(record));
                AddressSpace((self.records.len() - 1) as u32)
            }
        }
    }

    pub(crate) fn get(&self, space: AddressSpace) -> &SpaceRecord {
        match self.records.get(space.0 as usize) {
            Some(Some(record)) => record,
            _ => panic!("{:?} is not a live address space", space),
        }
    }

    pub(crate) fn get_mut(&mut self, space: AddressSpace) -> &mut SpaceRecord {
        match self.records.get_mut(space.0 as usize) {
            Some(Some(record)) => record,
            _ => panic!("{:?} is not a live address space", space),
        }
    }

    pub(crate) fn add_reference(&mut self, space: AddressSpace) {
        self.get_mut(space).refs += 1;
    }

    /// Drops one reference, returning true if it was the last one.
    pub(crate) fn release(&mut self, space: AddressSpace) -> bool {
        let record = self.get_mut(space);
        record.refs -= 1;
        record.refs == 0
    }

    pub(crate) fn remove(&mut self, space: AddressSpace) -> SpaceRecord {
        assert!(space != AddressSpace::KERNEL, "cannot destroy the kernel address space");
        let Some(record) = self.records.get_mut(space.0 as usize).and_then(Option::take) else {
            panic!("{:?} is not a live address space", space);
        };
        self.free.push(space.0);
        record
    }

    /// Number of live spaces, including the kernel.
    pub(crate) fn len(&self) -> usize {
        self.records.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel() -> SpaceRecord {
        SpaceRecord::new(SegmentId::KERNEL)
    }

    #[test]
    fn kernel_occupies_slot_zero() {
        let table = SpaceTable::new(kernel());
        assert_eq!(table.get(AddressSpace::KERNEL).id, SegmentId::KERNEL);
        assert_eq!(
            table.get(AddressSpace::KERNEL).vsid(13),
            SegmentId::KERNEL.vsid(13)
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn handles_are_recycled() {
        let mut table = SpaceTable::new(kernel());
        let a = table.insert(kernel());
        let b = table.insert(kernel());
        assert_ne!(a, b);
        table.remove(a);
        let c = table.insert(kernel());
        assert_eq!(a, c);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn reference_counting() {
        let mut table = SpaceTable::new(kernel());
        let space = table.insert(SpaceRecord::new(SegmentId::KERNEL));
        table.add_reference(space);
        assert!(!table.release(space));
        assert!(table.release(space));
    }

    #[test]
    #[should_panic(expected = "is not a live address space")]
    fn dead_handle_is_fatal() {
        let mut table = SpaceTable::new(kernel());
        let space = table.insert(SpaceRecord::new(SegmentId::KERNEL));
        table.remove(space);
        table.get(space);
    }

    #[test]
    #[should_panic(expected = "cannot destroy the kernel address space")]
    fn kernel_cannot_be_removed() {
        let mut table = SpaceTable::new(kernel());
        table.remove(AddressSpace::KERNEL);
    }
}
