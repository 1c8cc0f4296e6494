//! Loader interface.
//!
//! ELF/flat-binary parsing and filesystem access are external collaborators:
//! the loader is the party that reads a program off disk and hands the core
//! a fully-resolved [`ProcessImage`]. This module only defines that
//! hand-off shape and the helper the core uses to lay an image's code/data
//! into a freshly created address space.

use crate::error::{Error, KResult};
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::page_directory::{self, Attribute};
use crate::memory::physical;
use alloc::vec::Vec;

/// What the loader hands the core to create a process's initial address
/// space: entry point, target load address, and the code/data payloads to
/// place there, plus the argument vector.
pub struct ProcessImage<'a> {
    pub entry_point: VirtAddr,
    pub virtual_address: VirtAddr,
    pub code: &'a [u8],
    pub data: &'a [u8],
    pub image_size: u64,
    pub argv: Vec<&'a str>,
}

impl<'a> ProcessImage<'a> {
    pub fn argc(&self) -> usize {
        self.argv.len()
    }
}

/// Copy an image's code and data into `pid`'s address space at
/// `image.virtual_address`, then mark the code portion read-only.
///
/// Used by [`crate::task::process::create_new_process`] step 4 ("creates a
/// fresh page directory... remaps the image's code/data... marking code
/// read-only").
pub fn map_image(pid: u32, image: &ProcessImage) -> KResult<()> {
    let pages = (image.image_size + crate::memory::FRAME_SIZE as u64 - 1)
        / crate::memory::FRAME_SIZE as u64;
    let phys = physical::get_physical(
        pages * crate::memory::FRAME_SIZE as u64,
        crate::memory::FRAME_SIZE as u64,
        "process-image",
    )?;

    page_directory::map(pid, phys, image.virtual_address, image.image_size)?;

    unsafe {
        let dst = phys.as_u64() as *mut u8;
        let code_len = image.code.len().min(image.image_size as usize);
        core::ptr::copy_nonoverlapping(image.code.as_ptr(), dst, code_len);
        let data_len = image.data.len().min(image.image_size as usize - code_len);
        if data_len > 0 {
            core::ptr::copy_nonoverlapping(image.data.as_ptr(), dst.add(code_len), data_len);
        }
    }

    let code_size = (image.code.len() as u64 + crate::memory::FRAME_SIZE as u64 - 1)
        & !(crate::memory::FRAME_SIZE as u64 - 1);
    if code_size > 0 {
        page_directory::set_attrs(pid, Attribute::ReadOnly, image.virtual_address, code_size)?;
    }

    Ok(())
}

/// Copy `argc`/`argv` onto the top of a freshly allocated user stack,
/// rewriting pointers into the target address space, and return the new
/// stack pointer.
///
/// `stack_top` and `stack_virt_top` are the same address expressed in the
/// two address spaces the copy straddles: `stack_top` is a kernel-mapped
/// alias used to actually write the bytes, `stack_virt_top` is the address
/// as the target process will see it (used only for pointer rewriting).
pub fn push_args(
    stack_top: u64,
    stack_virt_top: u64,
    argv: &[&str],
) -> (u64, u64) {
    let mut sp = stack_top;
    let mut vsp = stack_virt_top;
    let mut ptrs: Vec<u64> = Vec::with_capacity(argv.len());

    for arg in argv.iter().rev() {
        let bytes = arg.as_bytes();
        sp -= (bytes.len() + 1) as u64;
        sp &= !0x7;
        vsp = stack_virt_top - (stack_top - sp);
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), sp as *mut u8, bytes.len());
            *((sp + bytes.len() as u64) as *mut u8) = 0;
        }
        ptrs.push(vsp);
    }
    ptrs.reverse();

    sp -= (ptrs.len() as u64 + 1) * 8;
    sp &= !0xF;
    vsp = stack_virt_top - (stack_top - sp);
    unsafe {
        let argv_ptr = sp as *mut u64;
        for (i, p) in ptrs.iter().enumerate() {
            argv_ptr.add(i).write(*p);
        }
        argv_ptr.add(ptrs.len()).write(0);
    }

    (sp, vsp)
}
