//! Raw address-space primitives used by the remapper.

use std::io;
use std::ptr::{self, NonNull};

use libc::c_void;

use crate::error::RemapError;
use crate::maps::Perms;

/// A private anonymous mapping owned by the remapper until it is moved into
/// place.  Dropping it unmaps it, so every early return releases it.
#[derive(Debug)]
pub struct ScratchRegion {
    ptr: NonNull<c_void>,
    len: usize,
}

impl ScratchRegion {
    /// Map `len` writable bytes at an address of the kernel's choosing.
    pub fn allocate(len: usize) -> Result<Self, RemapError> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(RemapError::Allocate {
                len,
                source: io::Error::last_os_error(),
            });
        }
        match NonNull::new(addr) {
            Some(ptr) => Ok(ScratchRegion { ptr, len }),
            None => Err(RemapError::Allocate {
                len,
                source: io::Error::from_raw_os_error(libc::ENOMEM),
            }),
        }
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Move this region so it occupies exactly `[target, target + len)`.
    ///
    /// This is a single `mremap(MREMAP_FIXED)`: the old mapping at `target`
    /// is replaced without the range ever being observably unmapped.  On
    /// failure the target is untouched and the scratch memory is released.
    ///
    /// # Safety
    ///
    /// Whatever was mapped at `target` is discarded.  The caller must own
    /// that range's contents, e.g. by having copied them into this region.
    pub unsafe fn relocate_to(self, target: usize) -> Result<usize, RemapError> {
        let moved = libc::mremap(
            self.ptr.as_ptr(),
            self.len,
            self.len,
            libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
            target as *mut c_void,
        );
        if moved == libc::MAP_FAILED {
            return Err(RemapError::Relocate {
                target,
                source: io::Error::last_os_error(),
            });
        }
        // The kernel owns the pages at `target` now.
        std::mem::forget(self);
        Ok(moved as usize)
    }
}

impl Drop for ScratchRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr(), self.len);
        }
    }
}

/// `mprotect` with the exact permission set of `perms`.
///
/// # Safety
///
/// Changing protections under live code or data can fault other threads.
pub unsafe fn protect(addr: usize, len: usize, perms: Perms) -> Result<(), RemapError> {
    if libc::mprotect(addr as *mut c_void, len, perms.to_prot()) != 0 {
        return Err(RemapError::Protect {
            addr,
            len,
            perms,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Make instruction fetches over `[start, start + len)` observe bytes that
/// were written through the data side.
#[cfg(target_arch = "aarch64")]
pub fn flush_instruction_cache(start: usize, len: usize) {
    use core::arch::asm;

    let ctr: u64;
    unsafe {
        asm!("mrs {0}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags));
    }
    let dline = 4usize << ((ctr >> 16) & 0xf);
    let iline = 4usize << (ctr & 0xf);
    let end = start + len;

    let mut addr = start & !(dline - 1);
    while addr < end {
        unsafe {
            asm!("dc cvau, {0}", in(reg) addr, options(nostack, preserves_flags));
        }
        addr += dline;
    }
    unsafe {
        asm!("dsb ish", options(nostack, preserves_flags));
    }

    let mut addr = start & !(iline - 1);
    while addr < end {
        unsafe {
            asm!("ic ivau, {0}", in(reg) addr, options(nostack, preserves_flags));
        }
        addr += iline;
    }
    unsafe {
        asm!("dsb ish", "isb", options(nostack, preserves_flags));
    }
}

#[cfg(target_arch = "arm")]
pub fn flush_instruction_cache(start: usize, len: usize) {
    // __ARM_NR_cacheflush
    const ARM_NR_CACHEFLUSH: libc::c_long = 0x0f0002;
    unsafe {
        libc::syscall(ARM_NR_CACHEFLUSH, start, start + len, 0);
    }
}

/// Instruction and data caches are coherent here.
#[cfg(not(any(target_arch = "aarch64", target_arch = "arm")))]
pub fn flush_instruction_cache(_start: usize, _len: usize) {}
