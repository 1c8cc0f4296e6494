//! Hardware Abstraction Layer — thin wrappers over the x86-64 primitives
//! that cross-cutting code (the spinlock, the scheduler's lock-phase
//! diagnostic) needs without reaching into `arch::x86` directly.
//!
//! Single-CPU target: there is no `arch::x86::smp`, so `cpu_id()` is
//! always 0 and [`MAX_CPUS`] is always 1.

/// Number of CPUs this kernel schedules onto. Always 1 — see module doc.
pub const MAX_CPUS: usize = 1;

/// Get the current CPU's ID. Always 0 on this single-CPU target.
#[inline]
pub fn cpu_id() -> usize {
    0
}

/// Under `cargo test` these wrappers never touch real CPU flags (`cli`/`sti`
/// are privileged instructions that fault in the hosted test process); a
/// single flag simulates IF so the spinlock's save/restore bookkeeping has
/// something consistent to read. The flag is decorative only — it never
/// gates the CAS loop that actually provides mutual exclusion.
#[cfg(test)]
static TEST_INTERRUPT_FLAG: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(true);

/// Enable interrupts on the current CPU.
#[inline]
pub fn enable_interrupts() {
    #[cfg(not(test))]
    unsafe { core::arch::asm!("sti", options(nomem, nostack)); }
    #[cfg(test)]
    TEST_INTERRUPT_FLAG.store(true, core::sync::atomic::Ordering::Relaxed);
}

/// Disable interrupts on the current CPU.
#[inline]
pub fn disable_interrupts() {
    #[cfg(not(test))]
    unsafe { core::arch::asm!("cli", options(nomem, nostack)); }
    #[cfg(test)]
    TEST_INTERRUPT_FLAG.store(false, core::sync::atomic::Ordering::Relaxed);
}

/// Check if interrupts are enabled on the current CPU.
#[inline]
pub fn interrupts_enabled() -> bool {
    #[cfg(not(test))]
    {
        let rflags: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(nomem)); }
        rflags & 0x200 != 0
    }
    #[cfg(test)]
    {
        TEST_INTERRUPT_FLAG.load(core::sync::atomic::Ordering::Relaxed)
    }
}

/// Halt the CPU (low-power wait for interrupt).
#[inline]
pub fn halt() {
    #[cfg(not(test))]
    unsafe { core::arch::asm!("hlt", options(nomem, nostack)); }
}
