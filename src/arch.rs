//! Thin wrappers around the CPU primitives the kernel core depends on.
//!
//! Hosted test builds replace these with recording no-ops so the scheduler,
//! semaphore and pipe state machines can be driven deterministically.

/// Interrupt vector used to force a reschedule from kernel code.
pub const YIELD_VECTOR: u8 = 0x81;

#[cfg(not(test))]
mod imp {
    pub fn enable_interrupts() {
        x86_64::instructions::interrupts::enable();
    }

    pub fn disable_interrupts() {
        x86_64::instructions::interrupts::disable();
    }

    pub fn halt() {
        x86_64::instructions::hlt();
    }

    /// Atomically unmask interrupts and halt. Poll loops inside syscalls run
    /// with IF clear, so a bare hlt there would never wake up.
    pub fn enable_and_halt() {
        x86_64::instructions::interrupts::enable_and_hlt();
    }

    /// Run `f` with interrupts masked, restoring the previous state after.
    pub fn without_interrupts<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        x86_64::instructions::interrupts::without_interrupts(f)
    }

    /// Trigger the reschedule vector synchronously. Software interrupts are
    /// not gated by IF, so this works inside interrupt-masked sections too.
    pub fn force_timer_interrupt() {
        unsafe {
            core::arch::asm!("int 0x81", options(nomem, nostack));
        }
    }
}


pub use imp::*;
