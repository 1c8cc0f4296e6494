//! Task State Segment (TSS) for Ring 3 to Ring 0 stack switching.
//!
//! In long mode the TSS no longer holds general-purpose register state —
//! task switching via `jmp`/`call` to a TSS selector doesn't exist on
//! x86-64. What survives is `RSP0..RSP2` (the stack the CPU loads on a
//! privilege-level change via `syscall`/interrupt) and the seven
//! `IST` stack pointers (used to force a fixed, known-good stack for
//! faults that must not run on a possibly-corrupt stack, e.g. double
//! fault). The scheduler updates `RSP0` on every context switch so that a
//! user-mode trap always lands on that thread's current kernel stack.

use core::arch::asm;
use core::mem::size_of;

/// x86-64 long-mode Task State Segment (Intel SDM Vol. 3A, 8.7).
#[repr(C, packed)]
pub struct Tss {
    _reserved0: u32,
    pub rsp0: u64,
    pub rsp1: u64,
    pub rsp2: u64,
    _reserved1: u64,
    pub ist1: u64,
    pub ist2: u64,
    pub ist3: u64,
    pub ist4: u64,
    pub ist5: u64,
    pub ist6: u64,
    pub ist7: u64,
    _reserved2: u64,
    _reserved3: u16,
    pub iomap_base: u16,
}

static mut TSS: Tss = Tss {
    _reserved0: 0,
    rsp0: 0,
    rsp1: 0,
    rsp2: 0,
    _reserved1: 0,
    ist1: 0,
    ist2: 0,
    ist3: 0,
    ist4: 0,
    ist5: 0,
    ist6: 0,
    ist7: 0,
    _reserved2: 0,
    _reserved3: 0,
    iomap_base: 0,
};

/// IST slot reserved for the double-fault handler (re-entrance
/// guard: a double fault must always run on a known-good stack, since the
/// stack that faulted may itself be the cause).
const DOUBLE_FAULT_IST_STACK_SIZE: usize = 16 * 1024;
static mut DOUBLE_FAULT_IST_STACK: [u8; DOUBLE_FAULT_IST_STACK_SIZE] = [0; DOUBLE_FAULT_IST_STACK_SIZE];

/// Initialize the TSS, install its descriptor in the GDT, and load the task register.
pub fn init() {
    unsafe {
        // No I/O permission bitmap at the TSS level — per-process I/O
        // permission is enforced in software (`process::IoPermBitmap`),
        // not via the hardware bitmap, so point iomap_base past the end
        // of the TSS to disable it entirely.
        TSS.iomap_base = size_of::<Tss>() as u16;

        // Default kernel stack; the scheduler overwrites this with each
        // thread's actual stack top on every context switch.
        let rsp: u64;
        asm!("mov {}, rsp", out(reg) rsp);
        TSS.rsp0 = rsp;

        let ist1_top = DOUBLE_FAULT_IST_STACK.as_mut_ptr().add(DOUBLE_FAULT_IST_STACK_SIZE) as u64;
        TSS.ist1 = ist1_top;

        let tss_base = &TSS as *const Tss as u64;
        let tss_limit = (size_of::<Tss>() - 1) as u32;
        super::gdt::set_tss_entry(tss_base, tss_limit);

        asm!(
            "ltr ax",
            in("ax") super::gdt::TSS_SEL,
            options(nostack, preserves_flags)
        );
    }

    crate::serial_println!("[OK] TSS initialized (selector {:#x})", super::gdt::TSS_SEL);
}

/// Update the kernel stack pointer in the TSS. Called by the scheduler on
/// every context switch so the next trap from user mode lands on the
/// incoming thread's kernel stack.
pub fn set_kernel_stack(rsp0: u64) {
    unsafe {
        TSS.rsp0 = rsp0;
    }
}

/// Read back the kernel stack pointer currently installed in the TSS.
pub fn get_kernel_stack() -> u64 {
    unsafe { TSS.rsp0 }
}
