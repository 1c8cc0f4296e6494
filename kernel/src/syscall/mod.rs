//! System call interface (`int 0x80`) -- dispatch and register layout.
//!
//! User programs invoke syscalls via `int 0x80` with the syscall number in
//! RAX and up to five `u64` arguments in RBX, RCX, RDX, RSI, RDI. The
//! assembly stub (`syscall_entry.asm`) saves registers and calls
//! [`syscall_dispatch`], which routes to the handler below and leaves the
//! result in RAX for the stub to restore.
//!
//! Only process/thread lifecycle, scheduling, signals, and the per-process
//! console streams are handled here -- filesystems, networking, window
//! management, and driver I/O are external collaborators layered on top of
//! this core and are out of scope for this crate.

use crate::error::Error;
use crate::task::{process, scheduler};

// Process lifecycle
pub const SYS_EXIT: u32 = 1;
pub const SYS_GETPID: u32 = 6;
pub const SYS_YIELD: u32 = 7;
pub const SYS_SLEEP: u32 = 8;
pub const SYS_WAITPID: u32 = 12;
pub const SYS_KILL: u32 = 13;
pub const SYS_KILLALL: u32 = 14;
pub const SYS_DETACH: u32 = 15;
pub const SYS_SPAWN: u32 = 27;
pub const SYS_SETPRIORITY: u32 = 34;

// Working directory (process-table-resident core state)
pub const SYS_GETCWD: u32 = 25;
pub const SYS_CHDIR: u32 = 26;

// Signals and I/O permission
pub const SYS_SIGSET: u32 = 70;
pub const SYS_SIGSEND: u32 = 71;
pub const SYS_SIGREAD: u32 = 72;
pub const SYS_SETIOPERM: u32 = 73;

// Per-process console streams
pub const SYS_CONSOLE_WRITE: u32 = 80;
pub const SYS_CONSOLE_READ: u32 = 81;

/// Register frame pushed by `syscall_entry.asm` before calling [`syscall_dispatch`].
#[repr(C)]
pub struct SyscallRegs {
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
    // CPU-pushed (INT 0x80)
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

pub fn init() {
    crate::serial_println!("[OK] Syscall interface initialized (int 0x80)");
}

/// Read `len` bytes out of the caller's address space at `ptr` as a `&str`.
///
/// Syscall arguments that name a user buffer are taken on faith: a full
/// implementation would walk the caller's page tables to bound-check the
/// access before dereferencing. Single-address-space-per-process plus the
/// absence of an untrusted-loader story in this core means every caller here
/// is presumed to pass a valid pointer into its own mapped region.
unsafe fn user_str<'a>(ptr: u64, len: u64) -> &'a str {
    let slice = core::slice::from_raw_parts(ptr as *const u8, len as usize);
    core::str::from_utf8_unchecked(slice)
}

fn ok() -> u64 {
    0
}

fn err(e: Error) -> u64 {
    e.as_i32() as i64 as u64
}

fn result_to_regval(r: Result<(), Error>) -> u64 {
    match r {
        Ok(()) => ok(),
        Err(e) => err(e),
    }
}

/// Called from `syscall_entry.asm`.
///
/// INT 0x80 convention: RAX=num, RBX=arg1, RCX=arg2, RDX=arg3, RSI=arg4,
/// RDI=arg5. The return value is written back into `regs.rax` so the stub's
/// `iretq` restores it into the caller's RAX.
#[no_mangle]
pub extern "C" fn syscall_dispatch(regs: &mut SyscallRegs) -> u64 {
    let syscall_num = regs.rax as u32;
    let arg1 = regs.rbx;
    let arg2 = regs.rcx;
    let arg3 = regs.rdx;
    let arg4 = regs.rsi;
    let _arg5 = regs.rdi;

    let caller = scheduler::current_pid();

    match syscall_num {
        SYS_EXIT => scheduler::exit_current(arg1 as i32),

        SYS_GETPID => caller as u64,

        SYS_YIELD => {
            scheduler::yield_now();
            ok()
        }

        SYS_SLEEP => {
            scheduler::wait_ms(arg1);
            ok()
        }

        // `waitpid(pid)`: block until the target terminates, then hand back
        // the exit code `terminate` deposited into `blockingExitCode`.
        SYS_WAITPID => {
            let target = arg1 as u32;
            scheduler::block(target);
            process::with_process(caller, |p| p.blocking_exit_code)
                .unwrap_or(Error::Killed.as_i32()) as i64 as u64
        }

        SYS_KILL => result_to_regval(process::kill(arg1 as u32, caller)),

        SYS_KILLALL => scheduler::kill_all(caller).len() as u64,

        SYS_DETACH => {
            scheduler::detach();
            ok()
        }

        // `spawn(entry, name_ptr, name_len, priority)`: a new thread sharing
        // the caller's address space.
        SYS_SPAWN => {
            let entry = crate::memory::address::VirtAddr::new(arg1);
            let name = unsafe { user_str(arg2, arg3) };
            let priority = arg4 as u8;
            match process::spawn(caller, entry, name, priority) {
                Ok(pid) => pid as u64,
                Err(e) => err(e),
            }
        }

        SYS_SETPRIORITY => {
            result_to_regval(process::set_priority(arg1 as u32, arg2 as u8, caller))
        }

        SYS_GETCWD => {
            let buf = arg1 as *mut u8;
            let cap = arg2 as usize;
            process::with_process(caller, |p| {
                let bytes = p.current_directory.as_bytes();
                let n = bytes.len().min(cap);
                unsafe {
                    core::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, n);
                }
                n as u64
            })
            .unwrap_or(0)
        }

        SYS_CHDIR => {
            let path = unsafe { user_str(arg1, arg2) };
            result_to_regval(process::set_current_directory(caller, path, caller))
        }

        SYS_SIGSET => {
            if let Err(e) = process::check_permission(caller, arg1 as u32) {
                return err(e);
            }
            result_to_regval(process::signal_set(arg1 as u32, arg2 as u32, arg3 != 0))
        }

        SYS_SIGSEND => {
            if let Err(e) = process::check_permission(caller, arg1 as u32) {
                return err(e);
            }
            result_to_regval(process::signal(arg1 as u32, arg2 as u32))
        }

        SYS_SIGREAD => match process::signal_read(caller) {
            Ok(sig) => sig as u64,
            Err(e) => err(e),
        },

        SYS_SETIOPERM => {
            if let Err(e) = process::check_permission(caller, arg1 as u32) {
                return err(e);
            }
            result_to_regval(process::set_io_perm(arg1 as u32, arg2 as u16, arg3 != 0))
        }

        // `console_write(ptr, len)`: push bytes onto the calling process's
        // own `textOutput` stream; a console driver on
        // the other end drains it.
        SYS_CONSOLE_WRITE => {
            let bytes = unsafe { core::slice::from_raw_parts(arg1 as *const u8, arg2 as usize) };
            process::with_process(caller, |p| {
                let mut written = 0u64;
                for &b in bytes {
                    if p.text_output.push(b as u32).is_err() {
                        break;
                    }
                    written += 1;
                }
                written
            })
            .unwrap_or(0)
        }

        // `console_read(ptr, len)`: pop up to `len` bytes off `textInput`.
        SYS_CONSOLE_READ => {
            let buf = arg1 as *mut u8;
            let cap = arg2 as usize;
            process::with_process(caller, |p| {
                let mut n = 0usize;
                while n < cap {
                    match p.text_input.pop() {
                        Ok(byte) => {
                            unsafe { *buf.add(n) = byte as u8 };
                            n += 1;
                        }
                        Err(_) => break,
                    }
                }
                n as u64
            })
            .unwrap_or(0)
        }

        _ => {
            crate::serial_println!("Unknown syscall: {}", syscall_num);
            err(Error::NotImplemented)
        }
    }
}
