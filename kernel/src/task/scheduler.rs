//! Weighted-priority preemptive scheduler, single-CPU.
//!
//! Invoked either by the timer IRQ (`schedule_tick`) or by an explicit
//! `yield_now`. Each pass picks exactly one winner out of the process table
//! by the weight formula below, ages every loser's `waitTime` by one, and
//! performs a hardware context switch into the winner. There is no run
//! queue data structure beyond the process table itself — the table is
//! small enough (hobbyist-OS scale) that a linear scan per tick is the
//! teacher's own idiom for this kind of selection pass.

use crate::task::context::{context_switch, CpuContext};
use crate::task::process::{self, Process, ProcessState, ProcessType, Privilege};
use crate::sync::spinlock::Spinlock;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Discrete priority levels; 0 = real-time, `PRIORITY_LEVELS - 1` = background.
pub const PRIORITY_LEVELS: u8 = 8;
/// Weight contributed per priority level above background.
pub const PRIORITY_RATIO: u32 = 3;
/// How many scheduler slices elapse between `cpuPercent` recomputation passes.
pub const CPU_PERCENT_TIMESLICES: u32 = 300;
/// Fraction of a PIT full-count used as one timeslice (~8192 ticks).
pub const TIME_SLICE_LENGTH: u16 = 8192;

/// Per-process scheduler bookkeeping not worth carrying on [`Process`]
/// itself because it is reset/consulted only by the selection pass.
struct SchedEntry {
    pid: u32,
    wait_time: u32,
}

struct Scheduler {
    current: u32,
    kernel: u32,
    idle: u32,
    exception: u32,
    /// The scheduler's own kernel-thread id; deliberately not pushed into
    /// the process table's iterable list ("schedulerProcess (not
    /// in ProcessList)") since it never competes for selection.
    scheduler_pid: u32,
    switched_by_call: bool,
    processing_exception: bool,
    exception_address: u64,
    /// Last process to touch the FPU; `None` means no lazy-switch owner yet.
    fpu_process: Option<u32>,
    scheduler_time: u64,
    slice_count: u32,
    wait_times: Vec<SchedEntry>,
}

impl Scheduler {
    fn wait_time(&mut self, pid: u32) -> &mut u32 {
        if let Some(pos) = self.wait_times.iter().position(|e| e.pid == pid) {
            return &mut self.wait_times[pos].wait_time;
        }
        self.wait_times.push(SchedEntry { pid, wait_time: 0 });
        let last = self.wait_times.len() - 1;
        &mut self.wait_times[last].wait_time
    }

    fn drop_wait_time(&mut self, pid: u32) {
        self.wait_times.retain(|e| e.pid != pid);
    }
}

static SCHEDULER: Spinlock<Option<Scheduler>> = Spinlock::new(None);
/// Monotonic tick counter fed by the PIT IRQ; read by `sleep`/`wait`.
static TICKS: AtomicU64 = AtomicU64::new(0);
static NEXT_KTHREAD_ID: AtomicU32 = AtomicU32::new(1);

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Spawn the idle process, the exception kernel thread, and publish the
/// scheduler's own bookkeeping thread id — run once at boot before
/// interrupts are enabled ("idle process spawned
/// before first tick").
pub fn init() {
    let idle = spawn_kernel_thread("idle", idle_entry as u64, PRIORITY_LEVELS - 1)
        .expect("failed to spawn idle process");
    let exception = spawn_kernel_thread(
        "exception",
        crate::task::exception::exception_thread_entry as u64,
        0,
    )
    .expect("failed to spawn exception process");
    let _ = process::with_process(exception, |p| p.state = ProcessState::Sleeping);

    let scheduler_pid = NEXT_KTHREAD_ID.fetch_add(1, Ordering::Relaxed);

    *SCHEDULER.lock() = Some(Scheduler {
        current: idle,
        kernel: process::KERNEL_PID,
        idle,
        exception,
        scheduler_pid,
        switched_by_call: false,
        processing_exception: false,
        exception_address: 0,
        fpu_process: None,
        scheduler_time: 0,
        slice_count: 0,
        wait_times: Vec::new(),
    });

    let _ = process::with_process(idle, |p| p.state = ProcessState::Ready);
}

extern "C" fn idle_entry() -> ! {
    loop {
        unsafe { core::arch::asm!("sti; hlt"); }
    }
}

/// `spawnKernelThread`: creates a supervisor-privilege process running
/// entirely in kernel space, sharing the kernel's page directory. Runs with
/// interrupts disabled while it impersonates the kernel process, matching
/// §5 "critical region of spawnKernelThread".
pub fn spawn_kernel_thread(name: &str, entry: u64, priority: u8) -> Result<u32, crate::error::Error> {
    let saved_flags: u64;
    unsafe { core::arch::asm!("pushfq; pop {}; cli", out(reg) saved_flags) };
    let id = process::create_new_process(
        name,
        process::KERNEL_PID,
        priority,
        Privilege::Supervisor,
        process::AddressSpace::ShareOf(process::KERNEL_PID),
    )?;
    process::with_process(id, |p| {
        p.saved_context.rip = entry;
        p.saved_context.rsp = p.user_stack.top() - 8;
        p.state = ProcessState::Ready;
    })?;
    unsafe { core::arch::asm!("push {}; popfq", in(reg) saved_flags) };
    Ok(id)
}

pub fn current_pid() -> u32 {
    SCHEDULER.lock().as_ref().map(|s| s.current).unwrap_or(process::KERNEL_PID)
}

fn is_protected(pid: u32, sched: &Scheduler) -> bool {
    pid == process::KERNEL_PID || pid == sched.exception || pid == sched.idle
}

pub fn is_protected_process(pid: u32) -> bool {
    SCHEDULER.lock().as_ref().map(|s| is_protected(pid, s)).unwrap_or(pid == process::KERNEL_PID)
}

/// `block(pid)`: the current process blocks awaiting `pid`'s termination.
pub fn block(target: u32) {
    let current = current_pid();

    // kernelMultitaskerDuplicateIo: blocking on a process hands it the
    // caller's text I/O streams, so the target inherits the caller's
    // console while the caller is waiting on it.
    if let Ok((input, output)) =
        process::with_process(current, |p| (p.text_input.clone(), p.text_output.clone()))
    {
        let _ = process::with_process(target, |p| {
            p.text_input = input;
            p.text_output = output;
        });
    }

    let _ = process::with_process(current, |p| {
        p.wait_for_process = target;
        p.state = ProcessState::Waiting;
    });
    yield_now();
}

/// `wait(ms)`: sleep for `ms` milliseconds (approximated in scheduler ticks
/// via [`TICKS`], which the PIT IRQ increments once per timeslice).
pub fn wait_ms(ms: u64) {
    let current = current_pid();
    let wake_at = ticks() + ms;
    let _ = process::with_process(current, |p| {
        p.wait_until_ms = Some(wake_at);
        p.state = ProcessState::Waiting;
    });
    yield_now();
}

/// `detach`: severs the calling process's `waitForProcess` relationship
/// with its parent, letting a daemonized child outlive its parent's block.
pub fn detach() {
    let current = current_pid();
    let parent = process::with_process(current, |p| p.parent_id).unwrap_or(process::KERNEL_PID);
    let _ = process::with_process(parent, |p| {
        if p.wait_for_process == current {
            p.wait_for_process = 0;
            p.blocking_exit_code = 0;
            p.state = ProcessState::Ready;
        }
    });
}

/// Explicit cooperative yield: a direct call into the scheduler rather than
/// a timer interrupt, so the next selection pass knows this process already
/// used its slice this tick (`switchedByCall`).
pub fn yield_now() {
    run_pass(false);
}

/// PIT timer-IRQ entry point.
pub fn schedule_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    run_pass(true);
}

/// Mark the start of exception handling: freezes the selection pass on the
/// current runner until [`exception_end`] is called.
pub fn exception_begin(fault_pid: u32, fault_address: u64) {
    if let Some(sched) = SCHEDULER.lock().as_mut() {
        sched.processing_exception = true;
        sched.exception_address = fault_address;
        sched.current = fault_pid;
    }
}

pub fn exception_end() {
    if let Some(sched) = SCHEDULER.lock().as_mut() {
        sched.processing_exception = false;
    }
}

pub fn exception_pid() -> u32 {
    SCHEDULER.lock().as_ref().map(|s| s.exception).unwrap_or(process::KERNEL_PID)
}

/// Record `pid` as the last process to touch the FPU, returning the
/// previous owner (lazy FPU switch).
pub fn swap_fpu_owner(pid: u32) -> Option<u32> {
    SCHEDULER.lock().as_mut().and_then(|s| {
        let prev = s.fpu_process;
        s.fpu_process = Some(pid);
        prev
    })
}

/// The weighted-priority formula a single candidate contributes to a
/// selection pass. Pulled out of [`run_pass`] as a pure function so the
/// formula and the tie-break rule in [`should_replace_winner`] can be
/// exercised directly, without a live process table or a hardware context
/// switch.
fn candidate_weight(
    priority: u8,
    state: ProcessState,
    wait_time: u32,
    timer_driven: bool,
    last_slice: u32,
) -> u64 {
    if priority == 0 {
        u64::MAX
    } else if priority == PRIORITY_LEVELS - 1 {
        0
    } else if state == ProcessState::IoReady {
        (PRIORITY_LEVELS as u64 - 1) * PRIORITY_RATIO as u64 + wait_time as u64
    } else if !timer_driven && last_slice == TIME_SLICE_LENGTH as u32 {
        0
    } else {
        (PRIORITY_LEVELS as u64 - priority as u64) * PRIORITY_RATIO as u64 + wait_time as u64
    }
}

/// Whether `weight` should dethrone the incumbent winner. A strictly
/// greater weight always wins; on an exact tie the incumbent keeps the win
/// unless the challenger has strictly waited longer (kernelMultitasker.c's
/// `nextProc->waitTime >= miscProc->waitTime` keeps ties with the
/// incumbent).
fn should_replace_winner(weight: u64, winner_weight: u64, wait_time: u32, winner_wait: u32) -> bool {
    weight > winner_weight || (weight == winner_weight && wait_time > winner_wait)
}

/// The core selection pass. `timer_driven` selects
/// between "full slice" accounting and the yield-suppression rule.
fn run_pass(timer_driven: bool) {
    let prev_pid = current_pid();

    // Step 3: demote the previous runner if it was still marked running.
    let _ = process::with_process(prev_pid, |p| {
        if p.state == ProcessState::Running {
            p.state = ProcessState::Ready;
        }
        p.cpu_time += 1;
        p.last_slice = if timer_driven { TIME_SLICE_LENGTH as u32 } else { 0 };
    });

    let exception_in_flight = SCHEDULER.lock().as_ref().map(|s| s.processing_exception).unwrap_or(false);
    if exception_in_flight {
        // Step 5: don't disturb exception context.
        return;
    }

    // Step 2: periodic cpuPercent recompute.
    let do_recompute = {
        let mut guard = SCHEDULER.lock();
        let sched = guard.as_mut().unwrap();
        sched.scheduler_time += 1;
        sched.slice_count += 1;
        if sched.slice_count >= CPU_PERCENT_TIMESLICES {
            sched.slice_count = 0;
            true
        } else {
            false
        }
    };
    if do_recompute {
        recompute_cpu_percent();
    }

    // Step 4: selection pass with finished-reaping folded in.
    let now = ticks();
    let pids: Vec<u32> = process::with_table(|t| t.iter().map(|p| p.id).collect());

    let mut best: Option<(u32, u64)> = None; // (pid, weight)
    let mut to_reap: Vec<u32> = Vec::new();

    for pid in pids {
        let scheduler_pid = SCHEDULER.lock().as_ref().map(|s| s.scheduler_pid).unwrap_or(0);
        if pid == scheduler_pid {
            continue;
        }

        let snapshot = process::with_process(pid, |p| {
            if p.state == ProcessState::Waiting {
                if let Some(wake_at) = p.wait_until_ms {
                    if now >= wake_at {
                        p.wait_until_ms = None;
                        p.state = ProcessState::Ready;
                    }
                }
            }
            (p.state, p.priority)
        });
        let (state, priority) = match snapshot {
            Ok(v) => v,
            Err(_) => continue,
        };

        if state == ProcessState::Finished {
            to_reap.push(pid);
            continue;
        }
        if !matches!(state, ProcessState::Ready | ProcessState::IoReady | ProcessState::Running) {
            continue;
        }

        let wait_time = {
            let mut guard = SCHEDULER.lock();
            *guard.as_mut().unwrap().wait_time(pid)
        };

        let last_slice = if !timer_driven {
            process::with_process(pid, |p| p.last_slice).unwrap_or(0)
        } else {
            0
        };
        let weight = candidate_weight(priority, state, wait_time, timer_driven, last_slice);

        match best {
            None => best = Some((pid, weight)),
            Some((winner_pid, winner_weight)) => {
                let winner_wait = {
                    let mut guard = SCHEDULER.lock();
                    *guard.as_mut().unwrap().wait_time(winner_pid)
                };
                let replace = should_replace_winner(weight, winner_weight, wait_time, winner_wait);
                if replace {
                    let mut guard = SCHEDULER.lock();
                    *guard.as_mut().unwrap().wait_time(winner_pid) += 1;
                    best = Some((pid, weight));
                } else {
                    let mut guard = SCHEDULER.lock();
                    *guard.as_mut().unwrap().wait_time(pid) += 1;
                }
            }
        }
    }

    for pid in to_reap {
        let _ = process::kill(pid, current_pid());
    }

    // Step 6: nothing runnable — keep the previous runner.
    let (winner, switched) = match best {
        Some((pid, _)) => (pid, pid != prev_pid),
        None => (prev_pid, false),
    };

    // Step 7.
    {
        let mut guard = SCHEDULER.lock();
        let sched = guard.as_mut().unwrap();
        *sched.wait_time(winner) = 0;
        sched.current = winner;
        sched.switched_by_call = !timer_driven;
    }
    let _ = process::with_process(winner, |p| p.state = ProcessState::Running);

    if switched {
        switch_context(prev_pid, winner);
    }
}

fn recompute_cpu_percent() {
    let scheduler_time = SCHEDULER.lock().as_ref().map(|s| s.scheduler_time).unwrap_or(1).max(1);
    process::with_table(|table| {
        for p in table.iter_mut() {
            p.cpu_percent = ((p.cpu_time * 100) / scheduler_time).min(100) as u8;
            p.cpu_time = 0;
        }
    });
}

fn switch_context(from: u32, to: u32) {
    // SAFETY: both pids index live process-table entries during this call;
    // the table lock is not held across the asm context switch.
    let old_ctx: *mut CpuContext = match process::with_process(from, |p| &mut p.saved_context as *mut CpuContext) {
        Ok(ptr) => ptr,
        Err(_) => core::ptr::null_mut(),
    };
    let new_ctx: *const CpuContext = match process::with_process(to, |p| &p.saved_context as *const CpuContext) {
        Ok(ptr) => ptr,
        Err(_) => return,
    };
    if old_ctx.is_null() {
        return;
    }

    // Point the TSS's RSP0 at the incoming thread's kernel stack so a trap
    // from user mode right after this switch lands on the correct stack.
    let kstack_top = process::with_process(to, |p| {
        p.kernel_stack.as_ptr() as u64 + p.kernel_stack.len() as u64
    });
    if let Ok(top) = kstack_top {
        crate::arch::x86::tss::set_kernel_stack(top);
    }

    unsafe { context_switch(old_ctx, new_ctx) };
}

/// `exit_current(exitCode)`: the trampoline every kernel-thread entry point
/// eventually falls through to, and what `SYS_EXIT` calls for user
/// processes — routes into [`process::terminate`] then never returns.
pub fn exit_current(exit_code: i32) -> ! {
    let current = current_pid();
    let _ = process::terminate(current, exit_code);
    loop {
        yield_now();
    }
}

/// `killAll` exempting the kernel, exception thread, idle thread, and the
/// caller ("KillAll").
pub fn kill_all(caller: u32) -> Vec<u32> {
    let (exception, idle) = {
        let guard = SCHEDULER.lock();
        let s = guard.as_ref().unwrap();
        (s.exception, s.idle)
    };
    process::kill_all(&[exception, idle], caller)
}

pub fn drop_wait_time(pid: u32) {
    if let Some(sched) = SCHEDULER.lock().as_mut() {
        sched.drop_wait_time(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_zero_is_always_selected() {
        assert_eq!(candidate_weight(0, ProcessState::Ready, 0, true, 0), u64::MAX);
        assert_eq!(candidate_weight(0, ProcessState::Ready, 500, false, 0), u64::MAX);
    }

    #[test]
    fn background_priority_is_always_zero() {
        let bg = PRIORITY_LEVELS - 1;
        assert_eq!(candidate_weight(bg, ProcessState::Ready, 0, true, 0), 0);
        assert_eq!(candidate_weight(bg, ProcessState::Ready, 1000, true, 0), 0);
    }

    #[test]
    fn io_ready_uses_highest_non_realtime_weight_plus_wait() {
        let w = candidate_weight(4, ProcessState::IoReady, 7, true, 0);
        assert_eq!(w, (PRIORITY_LEVELS as u64 - 1) * PRIORITY_RATIO as u64 + 7);
    }

    #[test]
    fn yield_at_full_slice_is_suppressed_to_zero() {
        // A cooperative yield (timer_driven = false) right after burning a
        // full slice reads as weight 0, so it can't immediately win again.
        let w = candidate_weight(3, ProcessState::Ready, 9, false, TIME_SLICE_LENGTH as u32);
        assert_eq!(w, 0);
    }

    #[test]
    fn yield_before_full_slice_keeps_normal_weight() {
        let w = candidate_weight(3, ProcessState::Ready, 9, false, 1);
        assert_eq!(w, (PRIORITY_LEVELS as u64 - 3) * PRIORITY_RATIO as u64 + 9);
    }

    #[test]
    fn timer_driven_pass_ignores_last_slice() {
        // Step through run_pass's caller contract: timer-driven passes never
        // read last_slice (always passed as 0), so the formula is always the
        // general one, never the yield-suppression zero.
        let w = candidate_weight(3, ProcessState::Ready, 9, true, TIME_SLICE_LENGTH as u32);
        assert_eq!(w, (PRIORITY_LEVELS as u64 - 3) * PRIORITY_RATIO as u64 + 9);
    }

    /// Spec scenario 1: equal-priority A and B, both waitTime 0 at tick 1 —
    /// A (already running/incumbent) must win, and B's wait time ages to 1.
    #[test]
    fn equal_weight_tie_favors_incumbent() {
        let weight_a = candidate_weight(2, ProcessState::Ready, 0, true, 0);
        let weight_b = candidate_weight(2, ProcessState::Ready, 0, true, 0);
        assert_eq!(weight_a, weight_b);
        assert!(!should_replace_winner(weight_b, weight_a, 0, 0));
    }

    #[test]
    fn strictly_longer_wait_breaks_a_tie() {
        let weight_a = candidate_weight(2, ProcessState::Ready, 0, true, 0);
        let weight_b = candidate_weight(2, ProcessState::Ready, 1, true, 0);
        assert_eq!(weight_a, weight_b);
        assert!(should_replace_winner(weight_b, weight_a, 1, 0));
    }

    #[test]
    fn strictly_greater_weight_always_wins_regardless_of_wait() {
        let weight_a = candidate_weight(5, ProcessState::Ready, 100, true, 0);
        let weight_b = candidate_weight(1, ProcessState::Ready, 0, true, 0);
        assert!(weight_b > weight_a);
        assert!(should_replace_winner(weight_b, weight_a, 0, 100));
    }
}
