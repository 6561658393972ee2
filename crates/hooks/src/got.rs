//! In-process binding rewrite: overwrites the GOT slots through which loaded
//! objects reach an imported function.

use cloak_remap::maps::{self, Perms};
use cloak_remap::region::protect;
use cloak_remap::RemapError;
use log::{debug, warn};

use crate::elf::{self, LoadedObject};
use crate::error::HookError;
use crate::registry::{CommitSummary, InterceptionEntry, PltBackend};

/// [`PltBackend`] that patches the current process directly.
#[derive(Debug)]
pub struct GotPatcher {
    /// Path of the main program, which the linker reports with an empty name.
    exe_path: String,
}

impl GotPatcher {
    pub fn new() -> Self {
        let exe_path = std::env::current_exe()
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_default();
        GotPatcher { exe_path }
    }

    fn object_path<'a>(&'a self, object: &'a LoadedObject) -> &'a str {
        if object.name.is_empty() {
            &self.exe_path
        } else {
            &object.name
        }
    }
}

impl Default for GotPatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PltBackend for GotPatcher {
    fn commit(&mut self, entries: &[InterceptionEntry]) -> Result<CommitSummary, HookError> {
        let objects = elf::loaded_objects();
        let page = page_size();
        let mut summary = CommitSummary::default();

        for entry in entries {
            let mut rewritten = 0;
            for object in objects.iter().filter(|o| !o.is_vdso()) {
                if !entry.target.matches(self.object_path(object)) {
                    continue;
                }
                let Some(info) = (unsafe { object.dynamic_info() }) else {
                    continue;
                };
                for slot in unsafe { info.binding_slots(object.base, &entry.symbol) } {
                    match unsafe { rewrite_slot(object, slot, entry, page) } {
                        Ok(true) => rewritten += 1,
                        Ok(false) => {}
                        Err(err) => warn!(
                            "cannot rewrite {} in {}: {}",
                            entry.symbol_name(),
                            self.object_path(object),
                            err
                        ),
                    }
                }
            }

            if rewritten > 0 {
                debug!("{}: rewrote {} bindings", entry.symbol_name(), rewritten);
                summary.resolved.push(entry.symbol_name());
            } else {
                summary.missing.push(entry.symbol_name());
            }
            summary.rewritten += rewritten;
        }
        Ok(summary)
    }
}

/// Point one binding slot at the entry's replacement.  Returns `false` when
/// the slot already points there.
unsafe fn rewrite_slot(
    object: &LoadedObject,
    slot: usize,
    entry: &InterceptionEntry,
    page: usize,
) -> Result<bool, RemapError> {
    let cell = slot as *mut usize;
    let current = std::ptr::read_volatile(cell);
    if current == entry.replacement {
        return Ok(false);
    }

    // A lazily bound slot still points at the object's own PLT stub.
    let original = if object.contains(current) {
        elf::resolve_default(&entry.symbol).unwrap_or(current)
    } else {
        current
    };
    entry.original.set_if_empty(original);

    let perms = maps::find_containing(slot)
        .map(|record| record.perms)
        .unwrap_or(Perms::READ);
    let page_start = slot & !(page - 1);
    let read_only = !perms.contains(Perms::WRITE);
    if read_only {
        protect(page_start, page, perms | Perms::READ | Perms::WRITE)?;
    }
    std::ptr::write_volatile(cell, entry.replacement);
    if read_only {
        // The slot is rewritten either way.
        if let Err(err) = protect(page_start, page, perms) {
            warn!("{}: {}", entry.symbol_name(), err);
        }
    }
    Ok(true)
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    use crate::registry::ObjectMatcher;
    use crate::slot::HookSlot;

    static ORIGINAL: HookSlot = HookSlot::new("cloak_test_symbol");

    #[test]
    fn read_only_slot_is_rewritten_and_sealed_again() {
        let page = page_size();
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);
        let slot = addr as usize + 16;
        unsafe {
            std::ptr::write(slot as *mut usize, 0x7000_1000);
            protect(addr as usize, page, Perms::READ).unwrap();
        }

        let object = LoadedObject {
            name: "libcloak-test.so".to_string(),
            base: 0,
            dynamic: None,
            load_start: 0,
            load_end: 0,
        };
        let entry = InterceptionEntry {
            target: ObjectMatcher::All,
            symbol: CString::new("cloak_test_symbol").unwrap(),
            replacement: 0x7000_2000,
            original: &ORIGINAL,
        };

        assert!(unsafe { rewrite_slot(&object, slot, &entry, page) }.unwrap());
        assert_eq!(unsafe { std::ptr::read_volatile(slot as *const usize) }, 0x7000_2000);
        assert_eq!(ORIGINAL.get(), Some(0x7000_1000));
        assert_eq!(maps::find_containing(slot).unwrap().perms, Perms::READ);

        assert!(!unsafe { rewrite_slot(&object, slot, &entry, page) }.unwrap());

        unsafe {
            libc::munmap(addr, page);
        }
    }
}
