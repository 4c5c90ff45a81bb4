//! 32-bit OEA (PowerPC 6xx/7xx/74xx) hardware adapter.

use core::arch::asm;

use super::SEGMENT_SHIFT;
use crate::port::{HardwareTlbPort, ProcessorPort};
use crate::{PhysicalAddress, VirtualAddress, Vsid};

/// Smallest hashed page table the architecture supports, in groups (64 KiB).
pub const MIN_PTEG_COUNT: usize = 0x400;

/// External interrupt enable bit of the machine state register.
const MSR_EE: usize = 0x8000;

/// Data/instruction cache block size.
const CACHE_LINE_SIZE: usize = 32;

/// The processor this code is running on.
///
/// All methods act on the local processor; `tlbie` is broadcast by the hardware.
pub struct OeaMmu;

impl HardwareTlbPort for OeaMmu {
    #[inline]
    fn invalidate(&self, va: VirtualAddress) {
        // SAFETY: tlbie only discards cached translations.
        unsafe {
            asm!("tlbie {0}", "eieio", in(reg) va.as_usize(), options(nostack));
        }
    }

    #[inline]
    fn sync_local(&self) {
        // SAFETY: A barrier has no architectural side effects beyond ordering.
        unsafe { asm!("sync", options(nostack)) };
    }

    #[inline]
    fn sync_global(&self) {
        // SAFETY: Waits for prior tlbie operations to complete on all processors.
        unsafe { asm!("tlbsync", "sync", options(nostack)) };
    }

    fn timebase(&self) -> u64 {
        let (mut upper, mut lower, mut check): (u32, u32, u32);
        loop {
            // SAFETY: Reading the time base has no side effects.
            unsafe {
                asm!(
                    "mftbu {0}",
                    "mftb {1}",
                    "mftbu {2}",
                    out(reg) upper,
                    out(reg) lower,
                    out(reg) check,
                    options(nomem, nostack),
                );
            }
            if upper == check {
                return ((upper as u64) << 32) | lower as u64;
            }
        }
    }
}

impl ProcessorPort for OeaMmu {
    fn disable_interrupts(&self) -> usize {
        let msr: usize;
        // SAFETY: Clearing MSR[EE] only masks external interrupts.
        unsafe {
            asm!("mfmsr {0}", out(reg) msr, options(nomem, nostack));
            asm!("mtmsr {0}", "isync", in(reg) msr & !MSR_EE, options(nostack));
        }
        msr
    }

    fn restore_interrupts(&self, state: usize) {
        // SAFETY: `state` is an MSR value previously read by `disable_interrupts`.
        unsafe { asm!("mtmsr {0}", "isync", in(reg) state, options(nostack)) };
    }

    fn load_segment(&self, segment: usize, vsid: Vsid) {
        // SAFETY: Callers only load segments whose translations they own.
        unsafe {
            asm!(
                "mtsrin {0}, {1}",
                "isync",
                in(reg) vsid.as_u32(),
                in(reg) segment << SEGMENT_SHIFT,
                options(nostack),
            );
        }
    }

    fn segment(&self, segment: usize) -> Vsid {
        let value: u32;
        // SAFETY: Reading a segment register has no side effects.
        unsafe {
            asm!(
                "mfsrin {0}, {1}",
                out(reg) value,
                in(reg) segment << SEGMENT_SHIFT,
                options(nomem, nostack),
            );
        }
        Vsid::new(value & Vsid::MASK)
    }

    fn load_table(&self, base: PhysicalAddress, mask: usize) {
        let sdr1 = base.as_usize() | (mask >> 10);
        // SAFETY: Called once at bootstrap with a zeroed, correctly aligned table.
        unsafe { asm!("sync", "mtsdr1 {0}", "isync", in(reg) sdr1, options(nostack)) };
    }

    fn sync_icache(&self, pa: PhysicalAddress, len: usize) {
        let start = pa.as_usize() & !(CACHE_LINE_SIZE - 1);
        let end = pa.as_usize() + len;
        // SAFETY: Physical memory is identity mapped in real mode, and these cache
        // operations do not modify memory contents.
        unsafe {
            for line in (start..end).step_by(CACHE_LINE_SIZE) {
                asm!("dcbst 0, {0}", in(reg) line, options(nostack));
            }
            asm!("sync", options(nostack));
            for line in (start..end).step_by(CACHE_LINE_SIZE) {
                asm!("icbi 0, {0}", in(reg) line, options(nostack));
            }
            asm!("sync", "isync", options(nostack));
        }
    }
}
