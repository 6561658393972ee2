//! Rewrites the backing storage of a module's mappings.
//!
//! For every range of the module, a scratch region receives a verbatim copy
//! of the range and is then moved over it in one `mremap` call, after which
//! the original protections are restored.  The address, size, content and
//! protection of the range are unchanged; only its backing is now anonymous.

use std::ptr;

use log::{error, info, warn};

use crate::error::RemapError;
use crate::maps::{self, MapRecord, Perms};
use crate::region::{flush_instruction_cache, protect, ScratchRegion};

/// What to do with the remaining ranges once one range fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abandon the rest of the module.  A failing allocator or `mremap`
    /// usually fails for every range.
    #[default]
    StopOnFirstFailure,
    /// Try every matched range regardless.
    ContinueOnFailure,
}

#[derive(Debug)]
pub struct RangeFailure {
    pub record: MapRecord,
    pub error: RemapError,
}

/// Outcome of one [`Remapper::remap`] call.
#[derive(Debug, Default)]
pub struct RemapReport {
    /// Bare file name the listing was filtered by.
    pub library: String,
    /// Number of ranges found in the listing.
    pub matched: usize,
    /// Ranges now backed by anonymous memory.
    pub remapped: Vec<MapRecord>,
    pub failures: Vec<RangeFailure>,
    /// Ranges skipped after a failure under [`FailurePolicy::StopOnFirstFailure`].
    pub unattempted: usize,
}

impl RemapReport {
    /// True when every matched range was remapped, including when nothing
    /// matched at all.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.unattempted == 0
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Remapper {
    policy: FailurePolicy,
}

impl Remapper {
    pub fn new(policy: FailurePolicy) -> Self {
        Remapper { policy }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Remap every currently mapped range of the library at `library_path`.
    ///
    /// Ranges are found by the last component of the path.  A library that is
    /// not mapped produces an empty, complete report.
    pub fn remap(&self, library_path: &str) -> RemapReport {
        let name = library_name(library_path);
        if name.is_empty() {
            warn!("Refusing to remap {:?}: no file name", library_path);
            return RemapReport::default();
        }
        let records = maps::find(name);
        self.remap_with(name, records, |record| unsafe { remap_range(record) })
    }

    fn remap_with<F>(&self, name: &str, records: Vec<MapRecord>, mut remap_one: F) -> RemapReport
    where
        F: FnMut(&MapRecord) -> Result<usize, RemapError>,
    {
        let mut report = RemapReport {
            library: name.to_string(),
            matched: records.len(),
            ..RemapReport::default()
        };
        if records.is_empty() {
            return report;
        }

        info!("Remapping {}", name);

        let mut pending = records.into_iter();
        while let Some(record) = pending.next() {
            match remap_one(&record) {
                Ok(addr) => {
                    info!("Allocated at address {:#x} with size of {}", addr, record.len());
                    report.remapped.push(record);
                }
                Err(err) => {
                    error!("Failed to remap {} at {:#x}: {}", name, record.start, err);
                    report.failures.push(RangeFailure { record, error: err });
                    if self.policy == FailurePolicy::StopOnFirstFailure {
                        report.unattempted = pending.len();
                        return report;
                    }
                }
            }
        }

        info!("Remapped");
        report
    }
}

/// Remap `library_path` with the default [`FailurePolicy`].
pub fn remap(library_path: &str) -> RemapReport {
    Remapper::default().remap(library_path)
}

/// Last `/`- or `\`-separated component of `path`.
pub fn library_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Replace the backing of one range with anonymous memory holding the same
/// bytes, then restore the range's protections.  Returns the range's address.
///
/// If allocation or relocation fails the original mapping is left as it was,
/// including its protections.
///
/// # Safety
///
/// `record` must describe a range that is still mapped.  Threads writing to
/// the range while it is copied may lose those writes.
pub unsafe fn remap_range(record: &MapRecord) -> Result<usize, RemapError> {
    remap_range_with(record, |scratch, target| scratch.relocate_to(target))
}

unsafe fn remap_range_with<F>(record: &MapRecord, relocate: F) -> Result<usize, RemapError>
where
    F: FnOnce(ScratchRegion, usize) -> Result<usize, RemapError>,
{
    let address = record.start;
    let size = record.len();

    let scratch = ScratchRegion::allocate(size)?;

    let widened = !record.perms.contains(Perms::READ);
    if widened {
        info!("Removing memory protection: {}", record.path);
        protect(address, size, record.perms | Perms::READ)?;
    }

    ptr::copy(address as *const u8, scratch.as_mut_ptr(), size);

    // The protection moves with the pages, so the target never holds the
    // write-only scratch mapping.
    let relocated = match protect(scratch.as_mut_ptr() as usize, size, record.perms) {
        Ok(()) => relocate(scratch, address),
        Err(err) => Err(err),
    };
    let moved = match relocated {
        Ok(moved) => moved,
        Err(err) => {
            if widened {
                if let Err(restore) = protect(address, size, record.perms) {
                    error!("{}", restore);
                }
            }
            return Err(err);
        }
    };

    // The range is already swapped; a failed restore does not undo that.
    if let Err(err) = protect(moved, size, record.perms) {
        warn!("{}", err);
    }
    flush_instruction_cache(moved, size);
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use std::os::fd::AsRawFd;

    fn record(start: usize, end: usize) -> MapRecord {
        MapRecord {
            start,
            end,
            perms: Perms::READ | Perms::EXEC,
            inode: 42,
            path: "/data/app/lib/libgadget.so".to_string(),
            ..MapRecord::default()
        }
    }

    fn three_ranges() -> Vec<MapRecord> {
        vec![record(0x1000, 0x2000), record(0x2000, 0x4000), record(0x4000, 0x5000)]
    }

    fn fail_second(record: &MapRecord) -> Result<usize, RemapError> {
        if record.start == 0x2000 {
            Err(RemapError::Allocate {
                len: record.len(),
                source: io::Error::from_raw_os_error(libc::ENOMEM),
            })
        } else {
            Ok(record.start)
        }
    }

    #[test]
    fn library_name_is_last_component() {
        assert_eq!(library_name("/data/local/tmp/libgadget.so"), "libgadget.so");
        assert_eq!(library_name("C:\\libs\\libgadget.so"), "libgadget.so");
        assert_eq!(library_name("libgadget.so"), "libgadget.so");
        assert_eq!(library_name("/data/local/tmp/"), "");
    }

    #[test]
    fn nothing_matched_is_a_complete_noop() {
        let mut calls = 0;
        let report = Remapper::default().remap_with("libgadget.so", Vec::new(), |_| {
            calls += 1;
            Ok(0)
        });
        assert_eq!(calls, 0);
        assert_eq!(report.matched, 0);
        assert!(report.is_complete());
    }

    #[test]
    fn stop_policy_abandons_remaining_ranges() {
        let report = Remapper::new(FailurePolicy::StopOnFirstFailure).remap_with(
            "libgadget.so",
            three_ranges(),
            fail_second,
        );
        assert_eq!(report.matched, 3);
        assert_eq!(report.remapped.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].record.start, 0x2000);
        assert_eq!(report.unattempted, 1);
        assert!(!report.is_complete());
    }

    #[test]
    fn continue_policy_attempts_every_range() {
        let report = Remapper::new(FailurePolicy::ContinueOnFailure).remap_with(
            "libgadget.so",
            three_ranges(),
            fail_second,
        );
        assert_eq!(report.remapped.len(), 2);
        assert_eq!(report.remapped[1].start, 0x4000);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.unattempted, 0);
    }

    #[test]
    fn ranges_are_processed_in_listing_order() {
        let mut seen = Vec::new();
        Remapper::default().remap_with("libgadget.so", three_ranges(), |record| {
            seen.push(record.start);
            Ok(record.start)
        });
        assert_eq!(seen, vec![0x1000, 0x2000, 0x4000]);
    }

    struct FileMapping {
        _file: tempfile::NamedTempFile,
        addr: usize,
        len: usize,
    }

    impl FileMapping {
        fn new(fill: u8, prot: libc::c_int) -> FileMapping {
            let len = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize } * 2;
            let mut file = tempfile::Builder::new()
                .prefix("libcloak-unit-")
                .suffix(".so")
                .tempfile()
                .unwrap();
            file.write_all(&vec![fill; len]).unwrap();
            file.flush().unwrap();
            let addr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    len,
                    prot,
                    libc::MAP_PRIVATE,
                    file.as_file().as_raw_fd(),
                    0,
                )
            };
            assert_ne!(addr, libc::MAP_FAILED);
            FileMapping {
                _file: file,
                addr: addr as usize,
                len,
            }
        }
    }

    impl Drop for FileMapping {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.addr as *mut libc::c_void, self.len);
            }
        }
    }

    #[test]
    fn failed_relocation_leaves_original_mapping_untouched() {
        let mapping = FileMapping::new(0x3c, libc::PROT_NONE);
        let record = maps::find_containing(mapping.addr).unwrap();
        assert_eq!(record.perms, Perms::NONE);

        let err = unsafe {
            remap_range_with(&record, |scratch, target| scratch.relocate_to(target + 1))
        }
        .unwrap_err();
        assert!(matches!(err, RemapError::Relocate { .. }));

        let after = maps::find_containing(mapping.addr).unwrap();
        assert_eq!(after.perms, Perms::NONE);
        assert_eq!(after.path, record.path);
        assert!(!after.is_anonymous());

        unsafe {
            protect(mapping.addr, mapping.len, Perms::READ).unwrap();
            let bytes = std::slice::from_raw_parts(mapping.addr as *const u8, mapping.len);
            assert!(bytes.iter().all(|&b| b == 0x3c));
        }
    }

    #[test]
    fn relocated_range_already_has_final_perms() {
        let mapping = FileMapping::new(0xc3, libc::PROT_READ | libc::PROT_EXEC);
        let record = maps::find_containing(mapping.addr).unwrap();

        let mut seen = None;
        let moved = unsafe {
            remap_range_with(&record, |scratch, target| {
                let moved = scratch.relocate_to(target)?;
                seen = maps::find_containing(moved).map(|r| r.perms);
                Ok(moved)
            })
        }
        .unwrap();
        assert_eq!(moved, mapping.addr);
        assert_eq!(seen, Some(Perms::READ | Perms::EXEC));
        assert!(maps::find_containing(moved).unwrap().is_anonymous());
    }

    #[test]
    fn path_without_file_name_is_refused() {
        let report = remap("/system/lib64/");
        assert_eq!(report.matched, 0);
        assert!(report.library.is_empty());
    }
}
