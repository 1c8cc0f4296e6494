//! x86-64 architecture support (single-CPU).
//!
//! Provides GDT, IDT, TSS, legacy PIC interrupt controller, PIT timer,
//! I/O port access, and IRQ management.

pub mod gdt;
pub mod idt;
pub mod irq;
pub mod pic;
pub mod pit;
pub mod port;
pub mod tss;
