//! Frame-backed storage for mapping objects.
//!
//! Mapping objects are allocated on the fault path, where the general-purpose heap may not
//! be usable, so they come from whole page frames obtained from a [`FrameSource`]. Each
//! frame is carved into fixed-size cells; free cells are threaded onto an intrusive free
//! list and reused before another frame is requested. Frames are never returned.

use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr::NonNull;

use crate::mapping::{Pvo, PvoHandle};
use crate::pmap::PmapError;
use crate::{AllocMode, FrameSource, PAGE_SIZE};

enum PvoCell {
    Free(Option<PvoHandle>),
    Used(Pvo),
}

pub(crate) const PVOS_PER_FRAME: usize = PAGE_SIZE / size_of::<PvoCell>();

pub(crate) struct PvoPool {
    frames: Vec<NonNull<PvoCell>>,
    free: Option<PvoHandle>,
    live: usize,
}

// SAFETY: The pool exclusively owns its frames; mutation is serialized by the owning
// `Pmap`'s lock.
unsafe impl Send for PvoPool {}

impl PvoPool {
    pub(crate) const fn new() -> Self {
        Self {
            frames: Vec::new(),
            free: None,
            live: 0,
        }
    }

    /// Number of objects currently allocated.
    pub(crate) fn live(&self) -> usize {
        self.live
    }

    /// Number of objects the pool can hold without requesting another frame.
    pub(crate) fn capacity(&self) -> usize {
        self.frames.len() * PVOS_PER_FRAME
    }

    /// Stores `pvo`, growing the pool by one frame if no cell is free.
    pub(crate) fn insert<F: FrameSource + ?Sized>(
        &mut self,
        pvo: Pvo,
        frames: &F,
        mode: AllocMode,
    ) -> Result<PvoHandle, PmapError> {
        if self.free.is_none() {
            self.grow(frames, mode)?;
        }
        let Some(handle) = self.free else {
            return Err(PmapError::OutOfMemory);
        };
        let cell = self.cell(handle);
        // SAFETY: `cell` points at an initialized cell owned by this pool.
        self.free = match unsafe { &*cell } {
            PvoCell::Free(next) => *next,
            PvoCell::Used(_) => panic!("pvo pool: free list points at a live object"),
        };
        // SAFETY: As above; the old value is a plain `Free` marker with nothing to drop.
        unsafe { cell.write(PvoCell::Used(pvo)) };
        self.live += 1;
        Ok(handle)
    }

    /// Returns the cell behind `handle` to the free list.
    pub(crate) fn remove(&mut self, handle: PvoHandle) -> Pvo {
        let cell = self.cell(handle);
        // SAFETY: `cell` points at an initialized cell owned by this pool.
        let pvo = match unsafe { &*cell } {
            PvoCell::Used(pvo) => *pvo,
            PvoCell::Free(_) => panic!("pvo pool: double free of {:?}", handle),
        };
        // SAFETY: As above.
        unsafe { cell.write(PvoCell::Free(self.free)) };
        self.free = Some(handle);
        self.live -= 1;
        pvo
    }

    pub(crate) fn get(&self, handle: PvoHandle) -> &Pvo {
        // SAFETY: `cell` points at an initialized cell owned by this pool, and the returned
        // borrow is tied to `&self`.
        match unsafe { &*self.cell(handle) } {
            PvoCell::Used(pvo) => pvo,
            PvoCell::Free(_) => panic!("pvo pool: stale mapping handle {:?}", handle),
        }
    }

    pub(crate) fn get_mut(&mut self, handle: PvoHandle) -> &mut Pvo {
        // SAFETY: As in `get`, with exclusivity from `&mut self`.
        match unsafe { &mut *self.cell(handle) } {
            PvoCell::Used(pvo) => pvo,
            PvoCell::Free(_) => panic!("pvo pool: stale mapping handle {:?}", handle),
        }
    }

    fn grow<F: FrameSource + ?Sized>(&mut self, frames: &F, mode: AllocMode) -> Result<(), PmapError> {
        let frame = frames.alloc_frame(mode).ok_or(PmapError::OutOfMemory)?;
        let Some(base) = NonNull::new(frame.to_ptr::<PvoCell>()) else {
            frames.free_frame(frame);
            return Err(PmapError::OutOfMemory);
        };

        let first = self.capacity();
        for index in (0..PVOS_PER_FRAME).rev() {
            // SAFETY: The frame is PAGE_SIZE bytes, page aligned, and exclusively ours.
            unsafe { base.as_ptr().add(index).write(PvoCell::Free(self.free)) };
            self.free = Some(PvoHandle::from_raw((first + index) as u32));
        }
        self.frames.push(base);
        log::trace!(
            "pvo pool: grew to {} objects with frame {}",
            self.capacity(),
            frame
        );
        Ok(())
    }

    fn cell(&self, handle: PvoHandle) -> *mut PvoCell {
        let raw = handle.into_raw() as usize;
        let frame = self.frames[raw / PVOS_PER_FRAME];
        // SAFETY: The index is below PVOS_PER_FRAME, within the frame.
        unsafe { frame.as_ptr().add(raw % PVOS_PER_FRAME) }
    }
}
