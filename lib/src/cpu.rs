//! Interrupt flag management: the irqsave/irqrestore pattern used by the
//! lock layer.

use x86_64::instructions::interrupts;
use x86_64::registers::rflags::{self, RFlags};

/// Save RFLAGS and disable interrupts (irqsave pattern).
/// Returns the saved RFLAGS value.
#[inline(always)]
pub fn save_flags_cli() -> u64 {
    let flags = rflags::read_raw();
    interrupts::disable();
    flags
}

/// Restore the interrupt flag from saved RFLAGS (irqrestore pattern).
/// Only re-enables interrupts if they were enabled in the saved flags.
#[inline(always)]
pub fn restore_flags(flags: u64) {
    if RFlags::from_bits_truncate(flags).contains(RFlags::INTERRUPT_FLAG) {
        interrupts::enable();
    }
}

/// Returns true if interrupts are currently enabled.
#[inline(always)]
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}
