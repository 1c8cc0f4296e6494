//! Process Table & Context.
//!
//! A [`Process`] is the one schedulable entity in the core: it may or may not
//! own its address space. A thread (as used here: "a process whose page
//! directory, environment, and symbol table alias its parent's") is not a
//! separate struct — it is a `Process` with `kind == ProcessType::Thread` and
//! `Arc`-shared environment/symbol-table/page-directory fields, so pointer
//! equality (`Arc::ptr_eq`) is the aliasing test this relies on.
//!
//! The table itself (`PROCESSES`) and the lifecycle operations
//! (`create_new_process`, `spawn`, `terminate`, `kill`, `kill_all`) live here;
//! [`crate::task::scheduler`] owns the run queue and the weighted-priority
//! selection pass over this table.

use crate::error::{Error, KResult};
use crate::ipc::signal::{SignalOutcome, SignalState};
use crate::ipc::stream::{ItemSize, Stream};
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::page_directory::{self, Privilege as PagePrivilege};
use crate::memory::physical;
use crate::sync::spinlock::Spinlock;
use crate::task::context::CpuContext;
use crate::task::loader::ProcessImage;
use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

/// Fixed sentinel process id for the kernel itself.
pub const KERNEL_PID: u32 = 0;

/// Default capacity of a process's text streams.
const TEXT_STREAM_CAPACITY: usize = 1024;
/// Size of the kernel-mode stack given to every process/thread.
const KERNEL_STACK_SIZE: usize = 64 * 1024;
/// Size of the user-mode stack given to every user process.
const USER_STACK_SIZE: usize = 256 * 1024;
/// I/O permission bitmap size: one bit per port, full 16-bit port space.
const IO_BITMAP_BYTES: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessType {
    Normal,
    Thread,
}

/// Process lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Ready,
    /// Temporary priority boost state (e.g. just woke from blocking I/O).
    IoReady,
    Waiting,
    Sleeping,
    Stopped,
    /// Tombstone visible to the scheduler; reaping follows.
    Finished,
    /// Permanent tombstone used when deletion itself failed mid-kill.
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Supervisor,
    User,
}

/// `environment`: a process's variable table, shared by pointer
/// (`Arc`) with every thread spawned under it.
#[derive(Default)]
pub struct Environment {
    entries: Vec<(String, String)>,
}

impl Environment {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value.to_string();
        } else {
            self.entries.push((key.to_string(), value.to_string()));
        }
    }

    pub fn unset(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }
}

/// `symbolTable`: a sorted
/// `(address, name)` table populated by whoever builds the process's
/// [`ProcessImage`] (the external loader). Empty for processes nobody
/// symbolicated.
#[derive(Default)]
pub struct SymbolTable {
    symbols: Vec<(VirtAddr, String)>,
}

impl SymbolTable {
    pub fn insert(&mut self, addr: VirtAddr, name: &str) {
        let pos = self.symbols.partition_point(|(a, _)| *a <= addr);
        self.symbols.insert(pos, (addr, name.to_string()));
    }

    /// Resolve `addr` to the nearest symbol at or below it.
    pub fn nearest(&self, addr: VirtAddr) -> Option<&str> {
        let idx = self.symbols.partition_point(|(a, _)| *a <= addr);
        if idx == 0 {
            None
        } else {
            Some(self.symbols[idx - 1].1.as_str())
        }
    }
}

pub type SharedEnv = Arc<Spinlock<Environment>>;
pub type SharedSymbols = Arc<Spinlock<SymbolTable>>;

/// A process or user stack region: base (lowest address) and size in bytes.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    pub base: VirtAddr,
    pub size: u64,
}

impl StackRegion {
    pub fn top(&self) -> u64 {
        self.base.as_u64() + self.size
    }
}

/// I/O port permission bitmap. Supervisor
/// processes carry an all-zero bitmap (unrestricted); user processes start
/// all-ones (denied) and clear individual bits via [`set_io_perm`].
pub struct IoPermBitmap(Box<[u8; IO_BITMAP_BYTES]>);

impl IoPermBitmap {
    fn unrestricted() -> Self {
        IoPermBitmap(Box::new([0u8; IO_BITMAP_BYTES]))
    }

    fn all_denied() -> Self {
        IoPermBitmap(Box::new([0xFFu8; IO_BITMAP_BYTES]))
    }

    pub fn is_allowed(&self, port: u16) -> bool {
        self.0[port as usize / 8] & (1 << (port % 8)) == 0
    }

    fn set(&mut self, port: u16, allow: bool) {
        let byte = port as usize / 8;
        let bit = 1u8 << (port % 8);
        if allow {
            self.0[byte] &= !bit;
        } else {
            self.0[byte] |= bit;
        }
    }
}

/// A schedulable entity. Threads are processes with
/// `kind == Thread` and `Arc`-shared `environment`/`symbol_table`; see the
/// module doc comment.
pub struct Process {
    pub id: u32,
    pub parent_id: u32,
    pub name: String,
    pub kind: ProcessType,
    pub state: ProcessState,
    pub priority: u8,
    pub privilege: Privilege,
    pub processor_privilege: Privilege,
    /// Non-owning external session grouping (0 = none).
    pub session: u32,
    pub current_directory: String,

    pub user_stack: StackRegion,
    pub super_stack: Option<StackRegion>,
    /// Owned (refcount 1) xor shared page directory.
    pub page_directory: PhysAddr,
    pub pd_owned: bool,

    pub saved_context: CpuContext,
    pub io_perm: IoPermBitmap,

    pub fpu_state: FxState,
    pub fpu_state_saved: bool,

    pub environment: SharedEnv,
    pub symbol_table: SharedSymbols,

    pub wait_until_ms: Option<u64>,
    pub wait_for_process: u32,
    pub blocking_exit_code: i32,

    pub cpu_time: u64,
    pub cpu_percent: u8,
    pub last_slice: u32,
    pub descendent_threads: u32,

    pub signals: SignalState,
    pub text_input: Stream,
    pub text_output: Stream,

    pub kernel_stack: Box<[u8]>,
}

/// Saved FPU/SSE state for FXSAVE/FXRSTOR (512 bytes, 16-byte aligned).
#[repr(C, align(16))]
pub struct FxState {
    pub data: [u8; 512],
}

impl FxState {
    pub fn new_default() -> Self {
        let mut s = FxState { data: [0u8; 512] };
        s.data[0] = 0x7F; // FCW: all x87 exceptions masked
        s.data[24] = 0x80; // MXCSR low byte
        s.data[25] = 0x1F; // MXCSR high byte: all SSE exceptions masked
        s
    }
}

/// Describes how to build a new process's address space.
pub enum AddressSpace<'a> {
    /// Create a fresh page directory and map `image` into it.
    Fresh { privilege: PagePrivilege, image: &'a ProcessImage<'a> },
    /// Share the parent's page directory (thread spawn).
    ShareOf(u32),
}

static NEXT_PID: AtomicU32 = AtomicU32::new(1);
static PROCESSES: Spinlock<Vec<Process>> = Spinlock::new(Vec::new());

fn alloc_pid() -> u32 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

fn new_kernel_stack() -> Box<[u8]> {
    alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice()
}

/// Run `f` with exclusive access to the process table.
pub fn with_table<R>(f: impl FnOnce(&mut Vec<Process>) -> R) -> R {
    f(&mut PROCESSES.lock())
}

pub fn with_process<R>(pid: u32, f: impl FnOnce(&mut Process) -> R) -> KResult<R> {
    let mut table = PROCESSES.lock();
    let p = table.iter_mut().find(|p| p.id == pid).ok_or(Error::NoSuchProcess)?;
    Ok(f(p))
}

pub fn exists(pid: u32) -> bool {
    PROCESSES.lock().iter().any(|p| p.id == pid)
}

/// Invariant: "Only a supervisor process, or one whose session
/// matches the target's session, may mutate another process's state,
/// priority, current directory, environment, or kill it." The kernel
/// itself (callers with `caller == KERNEL_PID`) always passes.
pub fn check_permission(caller: u32, target: u32) -> KResult<()> {
    if caller == KERNEL_PID || caller == target {
        return Ok(());
    }
    let (caller_privilege, caller_session) =
        with_process(caller, |p| (p.privilege, p.session))?;
    if caller_privilege == Privilege::Supervisor {
        return Ok(());
    }
    let target_session = with_process(target, |p| p.session)?;
    if caller_session != 0 && caller_session == target_session {
        return Ok(());
    }
    Err(Error::Permission)
}

/// Mutate `pid`'s scheduling priority, subject to the session/supervisor
/// permission check above.
pub fn set_priority(pid: u32, priority: u8, caller: u32) -> KResult<()> {
    check_permission(caller, pid)?;
    if priority >= crate::task::scheduler::PRIORITY_LEVELS {
        return Err(Error::Range);
    }
    with_process(pid, |p| p.priority = priority)
}

/// Mutate `pid`'s current working directory, subject to the same check.
pub fn set_current_directory(pid: u32, dir: &str, caller: u32) -> KResult<()> {
    check_permission(caller, pid)?;
    with_process(pid, |p| p.current_directory = dir.to_string())
}

/// `createNewProcess`. `parent_id` is the currently-running
/// process (the kernel is its own parent: pass [`KERNEL_PID`] at boot).
pub fn create_new_process(
    name: &str,
    parent_id: u32,
    priority: u8,
    privilege: Privilege,
    address_space: AddressSpace,
) -> KResult<u32> {
    let id = alloc_pid();

    let (parent_session, parent_cwd) = with_process(parent_id, |p| {
        (p.session, p.current_directory.clone())
    })
    .unwrap_or((0, String::from("/")));

    let (kind, pd_phys, pd_owned, environment, symbol_table, entry, user_stack) = match address_space
    {
        AddressSpace::Fresh { privilege: page_priv, image } => {
            let pd = page_directory::new_directory(id, page_priv)?;
            crate::task::loader::map_image(id, image)?;

            let stack_phys = physical::get(
                USER_STACK_SIZE as u64,
                crate::memory::FRAME_SIZE as u64,
                id,
                "user-stack",
            )?;
            let stack_base = page_directory::find_free(id, USER_STACK_SIZE as u64)?;
            page_directory::map(id, stack_phys, stack_base, USER_STACK_SIZE as u64)?;
            // Guard page: top page of the user stack is privileged (traps overflow).
            page_directory::set_attrs(
                id,
                crate::memory::page_directory::Attribute::Privileged,
                VirtAddr::new(stack_base.as_u64() + USER_STACK_SIZE as u64 - crate::memory::FRAME_SIZE as u64),
                crate::memory::FRAME_SIZE as u64,
            )?;
            let stack = StackRegion { base: stack_base, size: USER_STACK_SIZE as u64 };

            (
                ProcessType::Normal,
                pd,
                true,
                Arc::new(Spinlock::new(Environment::default())),
                Arc::new(Spinlock::new(SymbolTable::default())),
                image.entry_point,
                stack,
            )
        }
        AddressSpace::ShareOf(parent) => {
            let (pd, env, symtab, stack) = with_process(parent, |p| {
                (p.page_directory, p.environment.clone(), p.symbol_table.clone(), p.user_stack)
            })?;
            let pd = page_directory::share_directory(parent, id).unwrap_or(pd);
            (ProcessType::Thread, pd, false, env, symtab, VirtAddr::new(0), stack)
        }
    };

    let mut super_stack = None;
    if privilege == Privilege::User {
        let phys = physical::get(
            KERNEL_STACK_SIZE as u64,
            crate::memory::FRAME_SIZE as u64,
            id,
            "super-stack",
        )?;
        let base = page_directory::find_free(id, KERNEL_STACK_SIZE as u64)?;
        page_directory::map(id, phys, base, KERNEL_STACK_SIZE as u64)?;
        page_directory::set_attrs(
            id,
            crate::memory::page_directory::Attribute::Privileged,
            base,
            KERNEL_STACK_SIZE as u64,
        )?;
        super_stack = Some(StackRegion { base, size: KERNEL_STACK_SIZE as u64 });
    }

    let processor_privilege = if privilege == Privilege::Supervisor {
        Privilege::Supervisor
    } else {
        Privilege::User
    };

    let mut context = CpuContext::default();
    context.rip = entry.as_u64();
    context.rsp = user_stack.top() - 8;
    context.rflags = 0x202; // IF set
    context.cr3 = pd_phys.as_u64();

    let io_perm = match privilege {
        Privilege::Supervisor => IoPermBitmap::unrestricted(),
        Privilege::User => IoPermBitmap::all_denied(),
    };

    let process = Process {
        id,
        parent_id,
        name: name.to_string(),
        kind,
        state: ProcessState::Stopped,
        priority,
        privilege,
        processor_privilege,
        session: parent_session,
        current_directory: parent_cwd,
        user_stack,
        super_stack,
        page_directory: pd_phys,
        pd_owned,
        saved_context: context,
        io_perm,
        fpu_state: FxState::new_default(),
        fpu_state_saved: false,
        environment,
        symbol_table,
        wait_until_ms: None,
        wait_for_process: 0,
        blocking_exit_code: 0,
        cpu_time: 0,
        cpu_percent: 0,
        last_slice: 0,
        descendent_threads: 0,
        signals: SignalState::new(),
        text_input: Stream::new(TEXT_STREAM_CAPACITY, ItemSize::Byte),
        text_output: Stream::new(TEXT_STREAM_CAPACITY, ItemSize::Byte),
        kernel_stack: new_kernel_stack(),
    };

    PROCESSES.lock().push(process);

    if matches!(kind, ProcessType::Thread) {
        bump_thread_descendants(parent_id);
    }

    Ok(id)
}

/// `spawn`: thread spawning is `createNewProcess` with the page
/// directory, environment, and symbol table shared from `parent_id`.
pub fn spawn(parent_id: u32, entry: VirtAddr, name: &str, priority: u8) -> KResult<u32> {
    let privilege = with_process(parent_id, |p| p.privilege)?;
    let id = create_new_process(
        name,
        parent_id,
        priority,
        privilege,
        AddressSpace::ShareOf(parent_id),
    )?;
    with_process(id, |p| {
        p.saved_context.rip = entry.as_u64();
        p.saved_context.rsp = p.user_stack.top() - 8;
    })?;
    Ok(id)
}

/// Walk thread-typed ancestors incrementing `descendent_threads`, stopping at
/// the first non-thread ancestor.
fn bump_thread_descendants(mut pid: u32) {
    loop {
        let next = with_process(pid, |p| {
            p.descendent_threads += 1;
            if matches!(p.kind, ProcessType::Thread) {
                Some(p.parent_id)
            } else {
                None
            }
        });
        match next {
            Ok(Some(parent)) => pid = parent,
            _ => break,
        }
    }
}

fn drop_thread_descendants(mut pid: u32) {
    loop {
        let next = with_process(pid, |p| {
            p.descendent_threads = p.descendent_threads.saturating_sub(1);
            if matches!(p.kind, ProcessType::Thread) {
                Some(p.parent_id)
            } else {
                None
            }
        });
        match next {
            Ok(Some(parent)) => pid = parent,
            _ => break,
        }
    }
}

/// `deleteProcess`. A process may not delete itself — callers
/// terminating themselves must go through [`crate::task::scheduler::exit_current`].
pub fn delete_process(pid: u32, current_pid: u32) -> KResult<()> {
    if pid == current_pid {
        return Err(Error::Invalid);
    }
    if pid == KERNEL_PID {
        return Err(Error::Permission);
    }

    let (kind, pd_owned, is_thread_parent_alive) = with_process(pid, |p| {
        (p.kind, p.pd_owned, p.parent_id)
    })?;
    let _ = is_thread_parent_alive;

    physical::release_all_by_owner(pid);
    let _ = page_directory::delete_directory(pid);
    let _ = pd_owned;

    if matches!(kind, ProcessType::Thread) {
        let parent = with_process(pid, |p| p.parent_id)?;
        drop_thread_descendants(parent);
    }

    PROCESSES.lock().retain(|p| p.id != pid);
    Ok(())
}

/// `terminate(exitCode)`: deposit the exit code into any blocked
/// parent and drive this process to `finished` once it has no live thread
/// descendants. Returns once the caller should yield to the reaper.
pub fn terminate(pid: u32, exit_code: i32) -> KResult<()> {
    let parent_id = with_process(pid, |p| p.parent_id)?;
    let _ = with_process(parent_id, |parent| {
        if parent.wait_for_process == pid {
            parent.blocking_exit_code = exit_code;
            parent.wait_for_process = 0;
            parent.state = ProcessState::Ready;
        }
    });

    with_process(pid, |p| {
        if p.descendent_threads == 0 {
            p.state = ProcessState::Finished;
        }
        p.blocking_exit_code = exit_code;
    })
}

/// `kill(pid)`. Forbidden for the kernel and the scheduler's
/// idle/exception processes (checked by the caller via
/// [`crate::task::scheduler::is_protected`]). Recursively kills thread
/// children and any non-thread child the victim was itself blocked on,
/// inherits wait relationships, and reparents the remaining orphans.
pub fn kill(pid: u32, caller: u32) -> KResult<()> {
    if pid == KERNEL_PID {
        return Err(Error::Permission);
    }

    // A thread killing its own ancestor just terminates itself instead.
    if is_ancestor(pid, caller) {
        return terminate(caller, Error::Killed.as_i32());
    }

    check_permission(caller, pid)?;

    with_process(pid, |p| p.state = ProcessState::Stopped)?;

    let victim_wait = with_process(pid, |p| p.wait_for_process).unwrap_or(0);

    let (children, waiters): (Vec<u32>, Vec<u32>) = {
        let table = PROCESSES.lock();
        let children = table
            .iter()
            .filter(|p| {
                p.parent_id == pid
                    && (matches!(p.kind, ProcessType::Thread)
                        || (victim_wait != 0 && victim_wait == p.id))
            })
            .map(|p| p.id)
            .collect();
        let waiters = table
            .iter()
            .filter(|p| p.wait_for_process == pid)
            .map(|p| p.id)
            .collect();
        (children, waiters)
    };

    for waiter in waiters {
        // Victim's own wait target is inherited; otherwise the waiter wakes
        // with blockingExitCode = killed.
        let _ = with_process(waiter, |w| {
            if victim_wait != 0 {
                w.wait_for_process = victim_wait;
            } else {
                w.wait_for_process = 0;
                w.blocking_exit_code = Error::Killed.as_i32();
                w.state = ProcessState::Ready;
            }
        });
    }

    for child in children {
        kill(child, caller)?;
    }

    let parent_id = with_process(pid, |p| p.parent_id).unwrap_or(KERNEL_PID);
    reparent_orphans(pid, parent_id);

    let is_thread = with_process(pid, |p| matches!(p.kind, ProcessType::Thread)).unwrap_or(false);
    if is_thread {
        drop_thread_descendants(parent_id);
    }

    match delete_process(pid, caller) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Deletion failed: tombstone rather than lose the resources.
            with_process(pid, |p| p.state = ProcessState::Zombie)
        }
    }
}

fn is_ancestor(candidate: u32, of: u32) -> bool {
    let mut pid = of;
    loop {
        match with_process(pid, |p| p.parent_id) {
            Ok(parent) if parent == candidate => return true,
            Ok(parent) if parent != pid && parent != KERNEL_PID => pid = parent,
            _ => return false,
        }
    }
}

fn reparent_orphans(old_parent: u32, new_parent: u32) {
    let mut table = PROCESSES.lock();
    for p in table.iter_mut() {
        if p.parent_id == old_parent {
            p.parent_id = new_parent;
        }
    }
}

/// `killAll`: two passes — stop every killable process, then
/// kill them. Exempts the kernel and `caller`; idle/exception exemption is
/// layered on by [`crate::task::scheduler::kill_all`].
pub fn kill_all(exempt: &[u32], caller: u32) -> Vec<u32> {
    let victims: Vec<u32> = {
        let table = PROCESSES.lock();
        table
            .iter()
            .filter(|p| p.id != KERNEL_PID && p.id != caller && !exempt.contains(&p.id))
            .map(|p| p.id)
            .collect()
    };
    for &v in &victims {
        let _ = with_process(v, |p| p.state = ProcessState::Stopped);
    }
    let mut killed = Vec::new();
    for v in victims {
        if kill(v, caller).is_ok() {
            killed.push(v);
        }
    }
    killed
}

// ---- Signals, wired to process ids --------------------------------------

pub fn signal_set(pid: u32, sig: u32, on: bool) -> KResult<()> {
    with_process(pid, |p| p.signals.set(sig, on))?
}

pub fn signal(pid: u32, sig: u32) -> KResult<()> {
    let outcome = with_process(pid, |p| p.signals.signal(sig))?;
    if outcome == SignalOutcome::DefaultTerminate {
        terminate(pid, 0)?;
    }
    Ok(())
}

pub fn signal_read(pid: u32) -> KResult<u32> {
    with_process(pid, |p| p.signals.read())?
}

// ---- I/O permission -------------------------------------------------------

pub fn set_io_perm(pid: u32, port: u16, allow: bool) -> KResult<()> {
    with_process(pid, |p| p.io_perm.set(port, allow))
}

// ---- Environment ("propagateEnvironment") --------------------------------

/// `propagateEnvironment(pid)`: threads already alias the parent's
/// `Arc<Spinlock<Environment>>`, so there is nothing to copy — this exists as
/// the named hook external code (`exec`, shell builtins) calls after a bulk
/// environment mutation, matching the source's explicit function.
pub fn propagate_environment(_pid: u32) {}
