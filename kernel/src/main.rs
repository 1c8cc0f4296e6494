#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), feature(alloc_error_handler))]
#![allow(dead_code, static_mut_refs)]

extern crate alloc;

mod arch;
mod boot_info;
mod drivers;
mod error;
mod ipc;
mod memory;
mod panic;
mod sync;
mod syscall;
mod task;

use boot_info::BootInfo;

// The boot entry point and everything it drags in (CPU bring-up, the demo
// threads, the PIT IRQ handler) only make sense wired to real hardware and a
// bootloader-supplied `BootInfo`; under `cargo test` it is cfg'd out entirely
// so the hosted build never needs the link-time-provided kernel symbols
// (`_kernel_end` and friends) or a linker script.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn kernel_main(boot_info_addr: u32) -> ! {
    // Phase 1: Early output (serial only)
    drivers::serial::init();
    serial_println!("");
    serial_println!("==============================");
    serial_println!("  anyos kernel core");
    serial_println!("==============================");

    let boot_info = unsafe { &*(boot_info_addr as *const BootInfo) };
    if !boot_info.validate() {
        let magic = unsafe { core::ptr::addr_of!((*boot_info).magic).read_unaligned() };
        serial_println!("WARNING: BootInfo magic mismatch (got {:#010x})", magic);
    } else {
        serial_println!("BootInfo validated (magic OK)");
    }

    let kstart = unsafe { core::ptr::addr_of!((*boot_info).kernel_phys_start).read_unaligned() };
    let kend = unsafe { core::ptr::addr_of!((*boot_info).kernel_phys_end).read_unaligned() };
    serial_println!("Kernel loaded at {:#010x} - {:#010x}", kstart, kend);

    // Phase 2: CPU setup
    arch::x86::gdt::init();
    serial_println!("[OK] GDT initialized");

    arch::x86::idt::init();
    serial_println!("[OK] IDT initialized (256 entries + syscall int 0x80)");

    arch::x86::tss::init();
    serial_println!("[OK] TSS initialized (IST1 for double fault)");

    arch::x86::pic::init();
    serial_println!("[OK] PIC remapped (IRQ 0-15 -> INT 32-47)");

    arch::x86::pit::init();
    serial_println!("[OK] PIT configured ({} Hz)", arch::x86::pit::TICK_HZ);

    // Phase 3: Memory
    memory::physical::init(boot_info);
    memory::virtual_mem::init(boot_info);
    memory::heap::init();
    serial_println!("[OK] Physical allocator, address space, and heap ready");

    // `log` facade over the serial ring buffer; kept alongside
    // `serial_println!`/`debug_println!` for pre-heap and panic-path output
    // that must not depend on the logger being installed.
    drivers::serial::init_logger();
    log::info!("logging online");

    // Phase 4: Syscalls and scheduling
    syscall::init();
    task::scheduler::init();
    serial_println!("[OK] Scheduler initialized (idle + exception kernel threads)");

    spawn_demo_threads();

    // Phase 5: Interrupts. No APIC on this single-CPU target: the PIT's
    // IRQ0 handler both counts ticks and drives the scheduler's timer pass.
    arch::x86::irq::register_irq(0, irq_pit_tick_and_schedule);
    arch::x86::pic::unmask(0);
    unsafe { core::arch::asm!("sti") };
    serial_println!("[OK] Interrupts enabled (timer)");

    serial_println!("");
    serial_println!("anyos kernel core initialization complete.");
    serial_println!("");

    // The boot stack becomes the idle runner's context the first time the
    // scheduler preempts out of it; this loop is never exercised again
    // beyond that point.
    loop {
        unsafe { core::arch::asm!("hlt") };
    }
}

/// Spawn a handful of kernel threads at different priority levels to
/// exercise the weighted scheduler (there is no external loader/filesystem
/// in this core to hand it a real user-mode program).
#[cfg(not(test))]
fn spawn_demo_threads() {
    let threads: [(&str, extern "C" fn() -> !, u8); 3] = [
        ("demo-high", demo_high_entry, 0),
        ("demo-mid", demo_mid_entry, task::scheduler::PRIORITY_LEVELS / 2),
        ("demo-low", demo_low_entry, task::scheduler::PRIORITY_LEVELS - 2),
    ];
    for (name, entry, priority) in threads {
        match task::scheduler::spawn_kernel_thread(name, entry as u64, priority) {
            Ok(pid) => serial_println!("[OK] spawned {} (pid={}, priority={})", name, pid, priority),
            Err(e) => serial_println!("[WARN] failed to spawn {}: {}", name, e),
        }
    }
}

#[cfg(not(test))]
extern "C" fn demo_high_entry() -> ! {
    loop {
        log::trace!("demo-high tick");
        task::scheduler::yield_now();
    }
}

#[cfg(not(test))]
extern "C" fn demo_mid_entry() -> ! {
    loop {
        log::trace!("demo-mid tick");
        task::scheduler::wait_ms(50);
    }
}

#[cfg(not(test))]
extern "C" fn demo_low_entry() -> ! {
    loop {
        log::trace!("demo-low tick");
        task::scheduler::wait_ms(200);
    }
}

/// PIT IRQ 0 (legacy PIC, no APIC): timekeeping and scheduling together.
#[cfg(not(test))]
fn irq_pit_tick_and_schedule(_irq: u8) {
    arch::x86::pit::tick();
    task::scheduler::schedule_tick();
}
