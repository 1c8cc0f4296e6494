//! Interrupt Descriptor Table (IDT) for x86-64 long mode.
//!
//! Sets up 256 entries: CPU exceptions (ISR 0-31), hardware IRQs remapped
//! to INT 32-47 (legacy 8259 PIC, no APIC on this single-CPU target), and
//! the `int 0x80` syscall trap gate (DPL 3).

use core::arch::asm;
use core::mem::size_of;

/// Total IDT entries (covers the full x86 interrupt vector range).
const IDT_ENTRIES: usize = 256;
/// GDT selector for Ring 0 code segment.
const KERNEL_CODE_SEG: u16 = 0x08;

/// x86-64 IDT entry (16 bytes).
#[repr(C, packed)]
#[derive(Copy, Clone)]
struct IdtEntry {
    offset_low: u16,     // Handler address bits 0-15
    selector: u16,       // Kernel code segment selector
    ist: u8,             // IST index (bits 0-2), zero (bits 3-7)
    type_attr: u8,       // Gate type and attributes
    offset_mid: u16,     // Handler address bits 16-31
    offset_high: u32,    // Handler address bits 32-63
    _reserved: u32,      // Must be zero
}

#[repr(C, packed)]
struct IdtDescriptor {
    size: u16,
    offset: u64,
}

static mut IDT: [IdtEntry; IDT_ENTRIES] = [IdtEntry {
    offset_low: 0,
    selector: 0,
    ist: 0,
    type_attr: 0,
    offset_mid: 0,
    offset_high: 0,
    _reserved: 0,
}; IDT_ENTRIES];

static mut IDT_DESC: IdtDescriptor = IdtDescriptor { size: 0, offset: 0 };

// Gate type attributes (interpreted as 64-bit gates in long mode)
const GATE_INTERRUPT: u8 = 0x8E; // Present, DPL=0, 64-bit interrupt gate
const GATE_TRAP: u8 = 0x8F;      // Present, DPL=0, 64-bit trap gate
const GATE_TRAP_DPL3: u8 = 0xEF; // Present, DPL=3, 64-bit trap gate (for syscalls)

/// IST index for the double-fault handler (matches `tss::init`'s `ist1`).
const DOUBLE_FAULT_IST: u8 = 1;

fn set_gate(num: usize, handler: unsafe extern "C" fn(), selector: u16, type_attr: u8) {
    set_gate_ist(num, handler, selector, type_attr, 0);
}

fn set_gate_ist(num: usize, handler: unsafe extern "C" fn(), selector: u16, type_attr: u8, ist: u8) {
    let handler = handler as *const () as u64;
    unsafe {
        IDT[num] = IdtEntry {
            offset_low: (handler & 0xFFFF) as u16,
            selector,
            ist,
            type_attr,
            offset_mid: ((handler >> 16) & 0xFFFF) as u16,
            offset_high: ((handler >> 32) & 0xFFFFFFFF) as u32,
            _reserved: 0,
        };
    }
}

// External ISR/IRQ stubs (assembled and linked in via `build.rs`'s
// `ANYOS_ASM_OBJECTS`; they save the GPRs onto the stack, build an
// `InterruptFrame`, and call `isr_handler`/`irq_handler` below).
extern "C" {
    fn isr0();  fn isr1();  fn isr2();  fn isr3();
    fn isr4();  fn isr5();  fn isr6();  fn isr7();
    fn isr8();  fn isr9();  fn isr10(); fn isr11();
    fn isr12(); fn isr13(); fn isr14(); fn isr15();
    fn isr16(); fn isr17(); fn isr18(); fn isr19();
    fn isr20(); fn isr21(); fn isr22(); fn isr23();
    fn isr24(); fn isr25(); fn isr26(); fn isr27();
    fn isr28(); fn isr29(); fn isr30(); fn isr31();

    fn irq0();  fn irq1();  fn irq2();  fn irq3();
    fn irq4();  fn irq5();  fn irq6();  fn irq7();
    fn irq8();  fn irq9();  fn irq10(); fn irq11();
    fn irq12(); fn irq13(); fn irq14(); fn irq15();

    fn syscall_entry();
}

/// Populate the IDT with exception, IRQ, and syscall gates, then load via `lidt`.
pub fn init() {
    // CPU Exceptions (ISR 0-31)
    set_gate(0,  isr0 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(1,  isr1 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(2,  isr2 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(3,  isr3 , KERNEL_CODE_SEG, GATE_TRAP);
    set_gate(4,  isr4 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(5,  isr5 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(6,  isr6 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(7,  isr7 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    // Double fault: always run the handler on the dedicated IST1 stack, since
    // the stack that faulted may itself be the thing that's broken.
    set_gate_ist(8, isr8, KERNEL_CODE_SEG, GATE_INTERRUPT, DOUBLE_FAULT_IST);
    set_gate(9,  isr9 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(10, isr10, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(11, isr11, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(12, isr12, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(13, isr13, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(14, isr14, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(15, isr15, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(16, isr16, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(17, isr17, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(18, isr18, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(19, isr19, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(20, isr20, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(21, isr21, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(22, isr22, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(23, isr23, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(24, isr24, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(25, isr25, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(26, isr26, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(27, isr27, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(28, isr28, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(29, isr29, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(30, isr30, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(31, isr31, KERNEL_CODE_SEG, GATE_INTERRUPT);

    // Hardware IRQs (remapped to INT 32-47 by `pic::init`)
    set_gate(32, irq0 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(33, irq1 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(34, irq2 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(35, irq3 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(36, irq4 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(37, irq5 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(38, irq6 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(39, irq7 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(40, irq8 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(41, irq9 , KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(42, irq10, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(43, irq11, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(44, irq12, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(45, irq13, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(46, irq14, KERNEL_CODE_SEG, GATE_INTERRUPT);
    set_gate(47, irq15, KERNEL_CODE_SEG, GATE_INTERRUPT);

    // Syscall: int 0x80 - DPL=3 trap gate so Ring 3 code can invoke it
    set_gate(0x80, syscall_entry, KERNEL_CODE_SEG, GATE_TRAP_DPL3);

    // Load IDT
    unsafe {
        IDT_DESC = IdtDescriptor {
            size: (IDT_ENTRIES * size_of::<IdtEntry>() - 1) as u16,
            offset: (&raw const IDT) as *const _ as u64,
        };

        asm!(
            "lidt [{}]",
            in(reg) &raw const IDT_DESC,
            options(nostack, preserves_flags)
        );
    }
}

/// Interrupt stack frame for x86-64 long mode.
///
/// In 64-bit mode the CPU always pushes SS and RSP (even for same-privilege
/// interrupts). Our assembly stubs push all 15 GPRs individually (no pushad
/// in 64-bit mode).
#[repr(C)]
pub struct InterruptFrame {
    // Pushed by stub (last push = lowest address = first field)
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // Pushed by stub
    pub int_no: u64,
    pub err_code: u64,
    // Pushed by CPU
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// High-level CPU exception handler called from assembly ISR stubs.
///
/// Resolves the faulting address (CR2 for page faults, RIP otherwise) and
/// hands off to [`task::exception::dispatch`], which classifies the vector,
/// resolves the nearest symbol, and either terminates the offending process
/// (user-mode fault) or panics (kernel-mode fault or re-entrant double
/// fault).
#[no_mangle]
pub extern "C" fn isr_handler(frame: &InterruptFrame) {
    let from_kernel = frame.cs & 3 == 0;
    let fault_address = if frame.int_no == 14 {
        let cr2: u64;
        unsafe { core::arch::asm!("mov {}, cr2", out(reg) cr2) };
        cr2
    } else {
        frame.rip
    };
    let pid = crate::task::scheduler::current_pid();
    crate::task::exception::dispatch(frame.int_no as u8, pid, fault_address, from_kernel);
}

/// Hardware IRQ dispatcher called from assembly IRQ stubs.
///
/// Sends EOI to the (legacy) PIC before dispatching to the registered
/// handler, since handlers like the timer's may context-switch and never
/// return.
#[no_mangle]
pub extern "C" fn irq_handler(frame: &InterruptFrame) {
    let irq = (frame.int_no - 32) as u8;
    crate::arch::x86::pic::send_eoi(irq);
    crate::arch::x86::irq::dispatch_irq(irq);
}
