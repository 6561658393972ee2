//! Binding rewrite delegated to the host that loaded this library.

use std::ffi::CString;

use libc::{c_char, c_void};

use crate::error::HookError;
use crate::registry::{CommitSummary, InterceptionEntry, PltBackend};

/// Hook capability handed over by the host.
///
/// `register` selects objects by matching their path against a regular
/// expression and writes the replaced address through `original` during
/// `commit`.
#[repr(C)]
pub struct HostPltApi {
    pub register: unsafe extern "C" fn(
        pattern: *const c_char,
        symbol: *const c_char,
        replacement: *mut c_void,
        original: *mut *mut c_void,
    ),
    pub commit: unsafe extern "C" fn() -> bool,
}

pub struct HostBackend {
    api: &'static HostPltApi,
}

impl HostBackend {
    pub fn new(api: &'static HostPltApi) -> Self {
        HostBackend { api }
    }
}

impl PltBackend for HostBackend {
    fn commit(&mut self, entries: &[InterceptionEntry]) -> Result<CommitSummary, HookError> {
        // Kept alive until the host has committed.
        let mut patterns = Vec::with_capacity(entries.len());
        for entry in entries {
            let pattern = entry.target.host_pattern();
            let pattern = CString::new(pattern.clone()).map_err(|_| HookError::InvalidName(pattern))?;
            unsafe {
                (self.api.register)(
                    pattern.as_ptr(),
                    entry.symbol.as_ptr(),
                    entry.replacement as *mut c_void,
                    entry.original.as_out_ptr(),
                );
            }
            patterns.push(pattern);
        }

        if !unsafe { (self.api.commit)() } {
            return Err(HookError::HostRejectedCommit);
        }
        drop(patterns);

        let mut summary = CommitSummary::default();
        for entry in entries {
            if entry.original.get().is_some() {
                summary.resolved.push(entry.symbol_name());
            } else {
                summary.missing.push(entry.symbol_name());
            }
        }
        Ok(summary)
    }
}
