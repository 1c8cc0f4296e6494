//! Page Mapper: a small API in front of the MMU.
//!
//! Each process owns one [`PageDirectory`] record (refcounted so threads can
//! share their parent's); the actual page-table manipulation is delegated to
//! [`crate::memory::virtual_mem`]'s recursive-mapping primitives, which this
//! module treats as the hardware-facing backend.

use crate::error::{Error, KResult};
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::physical;
use crate::memory::virtual_mem;
use crate::memory::FRAME_SIZE;
use crate::sync::spinlock::Spinlock;
use alloc::vec::Vec;

/// Page attribute settable via [`set_attrs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    /// Writes fault (applied to code segments once loaded).
    ReadOnly,
    /// Faults if accessed from user-privilege code (stack guard pages, the
    /// entire supervisor stack of a user process).
    Privileged,
    WriteCombine,
    Uncacheable,
}

const PAGE_PRESENT: u64 = 1 << 0;
const PAGE_WRITABLE: u64 = 1 << 1;
const PAGE_USER: u64 = 1 << 2;
const PAGE_WRITE_THROUGH: u64 = 1 << 3;
const PAGE_CACHE_DISABLE: u64 = 1 << 4;

/// Privilege level a page directory (and by extension its owning process)
/// was created at — governs whether user pages get `PAGE_USER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Supervisor,
    User,
}

/// Per-directory bookkeeping record.
struct Entry {
    owner: u32,
    share_count: u32,
    privilege: Privilege,
    physical: PhysAddr,
}

static DIRECTORIES: Spinlock<Vec<Entry>> = Spinlock::new(Vec::new());

/// `newDirectory(processId)`: create a fresh page directory for a process
/// that needs its own address space.
pub fn new_directory(pid: u32, privilege: Privilege) -> KResult<PhysAddr> {
    let phys = virtual_mem::create_user_page_directory().ok_or(Error::Memory)?;
    let mut dirs = DIRECTORIES.lock();
    dirs.push(Entry { owner: pid, share_count: 1, privilege, physical: phys });
    Ok(phys)
}

/// `shareDirectory(fromPid, toPid)`: increments the share count instead of
/// creating a new directory (used when spawning a thread in the parent's
/// address space).
pub fn share_directory(from_pid: u32, to_pid: u32) -> KResult<PhysAddr> {
    let mut dirs = DIRECTORIES.lock();
    let idx = dirs.iter().position(|e| e.owner == from_pid).ok_or(Error::NoSuchEntry)?;
    dirs[idx].share_count += 1;
    let phys = dirs[idx].physical;
    let privilege = dirs[idx].privilege;
    dirs.push(Entry { owner: to_pid, share_count: 0, privilege, physical: phys });
    Ok(phys)
}

/// `deleteDirectory(processId)`: decrements the share count; frees the
/// underlying tables once it reaches zero.
pub fn delete_directory(pid: u32) -> KResult<()> {
    let mut dirs = DIRECTORIES.lock();
    let idx = dirs.iter().position(|e| e.owner == pid).ok_or(Error::NoSuchEntry)?;
    let phys = dirs[idx].physical;
    dirs.remove(idx);

    // Find the entry that actually holds the refcount (the directory's
    // original creator); every sharer past the first pushed a zero-count
    // alias above, so the real count lives on whichever entry still shares
    // this physical directory.
    if let Some(owner_idx) = dirs.iter().position(|e| e.physical == phys && e.share_count > 0) {
        dirs[owner_idx].share_count -= 1;
        if dirs[owner_idx].share_count == 0 {
            let owner_idx_phys = dirs[owner_idx].physical;
            dirs.remove(owner_idx);
            drop(dirs);
            virtual_mem::destroy_user_page_directory(owner_idx_phys);
        }
    } else {
        // No sharers left at all: this was the sole/last owner.
        drop(dirs);
        virtual_mem::destroy_user_page_directory(phys);
    }
    Ok(())
}

/// `map(pid, physical, virtual, size)`.
pub fn map(pid: u32, phys: PhysAddr, virt: VirtAddr, size: u64) -> KResult<()> {
    if !virt.is_page_aligned() {
        return Err(Error::Align);
    }
    let pages = pages_for(size);
    let pd_phys = directory_of(pid)?;
    let privilege = privilege_of(pid)?;
    for i in 0..pages {
        let v = VirtAddr::new(virt.as_u64() + i as u64 * FRAME_SIZE as u64);
        if virtual_mem::is_mapped_in_pd(pd_phys, v) {
            return Err(Error::Already);
        }
    }
    let flags = default_flags(privilege);
    for i in 0..pages {
        let v = VirtAddr::new(virt.as_u64() + i as u64 * FRAME_SIZE as u64);
        let p = PhysAddr::new(phys.as_u64() + i as u64 * FRAME_SIZE as u64);
        virtual_mem::map_page_in_pd(pd_phys, v, p, flags);
    }
    Ok(())
}

/// `mapToFree(pid, physical, &virtual, size)`.
pub fn map_to_free(pid: u32, phys: PhysAddr, size: u64) -> KResult<VirtAddr> {
    let virt = find_free(pid, size)?;
    map(pid, phys, virt, size)?;
    Ok(virt)
}

/// `unmap(pid, virtual, size)`.
pub fn unmap(pid: u32, virt: VirtAddr, size: u64) -> KResult<()> {
    let pd_phys = directory_of(pid)?;
    for i in 0..pages_for(size) {
        let v = VirtAddr::new(virt.as_u64() + i as u64 * FRAME_SIZE as u64);
        virtual_mem::unmap_page_in_pd(pd_phys, v);
    }
    Ok(())
}

/// `getPhysical(pid, virtual) -> physical or null`.
pub fn get_physical(pid: u32, virt: VirtAddr) -> Option<PhysAddr> {
    let pd_phys = directory_of(pid).ok()?;
    virtual_mem::translate_in_pd(pd_phys, virt)
}

/// `findFree(pid, size) -> virtual`. Linear scan of the user-space region
/// (below the kernel split) for a run of unmapped pages.
pub fn find_free(pid: u32, size: u64) -> KResult<VirtAddr> {
    let pd_phys = directory_of(pid)?;
    let pages = pages_for(size);
    // User region: 64 MiB..3.5 GiB, well clear of the identity-mapped low
    // memory and the kernel's higher-half split ("virtual-memory
    // layout convention").
    const USER_LOW: u64 = 0x0400_0000;
    const USER_HIGH: u64 = 0xC000_0000;
    let mut addr = USER_LOW;
    let mut run = 0usize;
    let mut run_start = addr;
    while addr < USER_HIGH {
        let v = VirtAddr::new(addr);
        if virtual_mem::is_mapped_in_pd(pd_phys, v) {
            run = 0;
        } else {
            if run == 0 {
                run_start = addr;
            }
            run += 1;
            if run >= pages {
                return Ok(VirtAddr::new(run_start));
            }
        }
        addr += FRAME_SIZE as u64;
    }
    Err(Error::Memory)
}

/// `setAttrs(pid, attribute, virtual, size)`.
pub fn set_attrs(pid: u32, attr: Attribute, virt: VirtAddr, size: u64) -> KResult<()> {
    let pd_phys = directory_of(pid)?;
    for i in 0..pages_for(size) {
        let v = VirtAddr::new(virt.as_u64() + i as u64 * FRAME_SIZE as u64);
        let phys = virtual_mem::translate_in_pd(pd_phys, v).ok_or(Error::NoSuchEntry)?;
        let mut flags = virtual_mem::read_pte_flags_in_pd(pd_phys, v).unwrap_or(PAGE_PRESENT);
        match attr {
            Attribute::ReadOnly => flags &= !PAGE_WRITABLE,
            Attribute::Privileged => flags &= !PAGE_USER,
            Attribute::WriteCombine => flags |= PAGE_WRITE_THROUGH,
            Attribute::Uncacheable => flags |= PAGE_CACHE_DISABLE,
        }
        virtual_mem::map_page_in_pd(pd_phys, v, phys, flags | PAGE_PRESENT);
    }
    Ok(())
}

/// `changeOwner(oldPid, newPid, remapFlag, oldVirtual, &newVirtual)` — spec
/// §4.1. Resolves `oldVirtual` to a physical address, updates the owning
/// [`crate::memory::physical::MemoryBlock`], and — if requested — remaps the
/// region into the new owner's address space and unmaps it from the old.
pub fn change_owner(
    old_pid: u32,
    new_pid: u32,
    remap: bool,
    old_virtual: VirtAddr,
) -> KResult<Option<VirtAddr>> {
    let phys = get_physical(old_pid, old_virtual).ok_or(Error::NoSuchEntry)?;
    let block = physical::find_block(phys).ok_or(Error::NoSuchEntry)?;
    physical::set_block_owner(phys, new_pid)?;

    if !remap {
        return Ok(None);
    }
    let new_virtual = map_to_free(new_pid, phys, block.size())?;
    unmap(old_pid, old_virtual, block.size())?;
    Ok(Some(new_virtual))
}

/// `share(sharerPid, shareePid, oldVirtual, &newVirtual)` — maps the region
/// into a second process's address space without changing ownership.
pub fn share(sharer_pid: u32, sharee_pid: u32, old_virtual: VirtAddr) -> KResult<VirtAddr> {
    let phys = get_physical(sharer_pid, old_virtual).ok_or(Error::NoSuchEntry)?;
    let block = physical::find_block(phys).ok_or(Error::NoSuchEntry)?;
    map_to_free(sharee_pid, phys, block.size())
}

fn pages_for(size: u64) -> usize {
    ((size + FRAME_SIZE as u64 - 1) / FRAME_SIZE as u64) as usize
}

fn directory_of(pid: u32) -> KResult<PhysAddr> {
    let dirs = DIRECTORIES.lock();
    dirs.iter().find(|e| e.owner == pid).map(|e| e.physical).ok_or(Error::NoSuchProcess)
}

fn privilege_of(pid: u32) -> KResult<Privilege> {
    let dirs = DIRECTORIES.lock();
    dirs.iter().find(|e| e.owner == pid).map(|e| e.privilege).ok_or(Error::NoSuchProcess)
}

fn default_flags(privilege: Privilege) -> u64 {
    let mut flags = PAGE_PRESENT | PAGE_WRITABLE;
    if privilege == Privilege::User {
        flags |= PAGE_USER;
    }
    flags
}
