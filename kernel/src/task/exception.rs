//! Exception & Signal Subsystem, exception half.
//!
//! The exception thread is a dedicated kernel thread, asleep until a CPU
//! exception vectors in. [`dispatch`] is what the IDT's fault stubs
//! (`arch::x86::idt`) call instead of handling faults inline: it captures
//! the faulting process, classifies the vector, resolves the faulting
//! address against the offender's symbol table, and either panics (fault
//! originated in the kernel, or a double-fault re-entered us) or marks the
//! offender `finished` and lets the scheduler reap it.
//!
//! `exception_thread_entry` exists to satisfy the "exception-as-kernel-
//! thread" idiom; on this single-CPU target `dispatch` is called directly
//! from the fault stub rather than via a task-gate context switch, since a
//! systems-language implementation can flatten that hand-off to a direct
//! function call.

use crate::memory::address::VirtAddr;
use crate::task::process::{self, ProcessState};
use crate::task::scheduler;
use alloc::string::ToString;
use core::sync::atomic::{AtomicBool, Ordering};

/// CPU exception vector classification (Intel vectors 0-19).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vector {
    DivideByZero,
    Debug,
    Nmi,
    Breakpoint,
    Overflow,
    BoundRangeExceeded,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    GeneralProtectionFault,
    PageFault,
    Other(u8),
}

impl Vector {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Vector::DivideByZero,
            1 => Vector::Debug,
            2 => Vector::Nmi,
            3 => Vector::Breakpoint,
            4 => Vector::Overflow,
            5 => Vector::BoundRangeExceeded,
            6 => Vector::InvalidOpcode,
            7 => Vector::DeviceNotAvailable,
            8 => Vector::DoubleFault,
            13 => Vector::GeneralProtectionFault,
            14 => Vector::PageFault,
            other => Vector::Other(other),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Vector::DivideByZero => "divide-by-zero",
            Vector::Debug => "debug",
            Vector::Nmi => "nmi",
            Vector::Breakpoint => "breakpoint",
            Vector::Overflow => "overflow",
            Vector::BoundRangeExceeded => "bounds",
            Vector::InvalidOpcode => "invalid-opcode",
            Vector::DeviceNotAvailable => "device-not-available",
            Vector::DoubleFault => "double-fault",
            Vector::GeneralProtectionFault => "general-protection",
            Vector::PageFault => "page-fault",
            Vector::Other(_) => "exception",
        }
    }
}

/// Re-entrance guard: a second exception while the first is still being
/// handled is an unrecoverable double-fault ("re-entrance").
static HANDLING: AtomicBool = AtomicBool::new(false);

/// Kernel-thread entry point registered with [`scheduler::init`]; parked
/// forever since `dispatch` is invoked directly by fault stubs on this
/// single-CPU target (see module doc comment).
pub extern "C" fn exception_thread_entry() -> ! {
    loop {
        unsafe { core::arch::asm!("hlt"); }
    }
}

/// Called by `arch::x86::idt`'s fault stubs. `fault_pid` is the process that
/// was running when the fault hit; `fault_address` is CR2 for page faults
/// or RIP otherwise; `from_kernel` is true iff the faulting code segment
/// was the kernel's. Returns normally for the vector-7 fast path and for a
/// user-mode fault that only marks its victim `finished` — the IDT stub's
/// `iretq` is what actually resumes execution (of the same process for
/// vector 7, or whatever the next scheduler tick picks otherwise).
pub fn dispatch(vector: u8, fault_pid: u32, fault_address: u64, from_kernel: bool) {
    if HANDLING.swap(true, Ordering::SeqCst) {
        panic!("double-fault during exception handling (re-entrant exception)");
    }

    let v = Vector::from_u8(vector);

    if v == Vector::DeviceNotAvailable {
        handle_fpu_lazy_switch(fault_pid);
        HANDLING.store(false, Ordering::SeqCst);
        return;
    }

    scheduler::exception_begin(fault_pid, fault_address);

    let symbol = process::with_process(fault_pid, |p| {
        p.symbol_table.lock().nearest(VirtAddr::new(fault_address)).map(|s| s.to_string())
    })
    .ok()
    .flatten();

    crate::serial_println!("=== EXCEPTION: {} (vector {}) ===", v.name(), vector);
    crate::serial_println!("  process: {}  fault address: {:#x}", fault_pid, fault_address);
    match &symbol {
        Some(s) => crate::serial_println!("  nearest symbol: {}", s),
        None => crate::serial_println!("  nearest symbol: <unknown>"),
    }

    if from_kernel {
        panic!("CPU exception {} in kernel code at {:#x}", v.name(), fault_address);
    }

    let _ = process::with_process(fault_pid, |p| p.state = ProcessState::Finished);
    crate::serial_println!("  process {} terminated due to exception", fault_pid);

    HANDLING.store(false, Ordering::SeqCst);
    scheduler::exception_end();
}

/// FPU lazy-switch handler ("device-not-available", vector 7):
/// on first FP use after a task switch, persist the previous owner's FPU
/// state and load (or initialize) the new owner's.
fn handle_fpu_lazy_switch(new_owner: u32) {
    let previous = scheduler::swap_fpu_owner(new_owner);

    if let Some(prev) = previous {
        if prev != new_owner {
            let _ = process::with_process(prev, |p| {
                save_fpu_state(&mut p.fpu_state);
                p.fpu_state_saved = true;
            });
        }
    }

    let _ = process::with_process(new_owner, |p| {
        if p.fpu_state_saved {
            restore_fpu_state(&p.fpu_state);
        } else {
            p.fpu_state = process::FxState::new_default();
            restore_fpu_state(&p.fpu_state);
            p.fpu_state_saved = true;
        }
    });

    clear_task_switched_flag();
}

fn save_fpu_state(state: &mut process::FxState) {
    unsafe { core::arch::asm!("fxsave [{}]", in(reg) state.data.as_mut_ptr()) };
}

fn restore_fpu_state(state: &process::FxState) {
    unsafe { core::arch::asm!("fxrstor [{}]", in(reg) state.data.as_ptr()) };
}

fn clear_task_switched_flag() {
    unsafe {
        let mut cr0: u64;
        core::arch::asm!("mov {}, cr0", out(reg) cr0);
        cr0 &= !(1 << 3); // CR0.TS
        core::arch::asm!("mov cr0, {}", in(reg) cr0);
    }
}
