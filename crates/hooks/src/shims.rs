//! Replacement functions installed over libc imports.
//!
//! * [`cloak_memfd_create`] renames memfds whose label identifies the
//!   injected component before creating them.
//! * [`cloak_fgets`] drops every line containing the maps marker, so text
//!   readers of `/proc/self/maps` never see memfd-backed mappings.
//!
//! Both reach the real function through a [`HookSlot`] filled at commit time.
//! Until then they fall back to `dlsym(RTLD_NEXT, ..)`.

use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;

use libc::{c_char, c_int, c_uint, FILE};

use crate::slot::HookSlot;

pub static ORIG_MEMFD_CREATE: HookSlot = HookSlot::new("memfd_create");
pub static ORIG_FGETS: HookSlot = HookSlot::new("fgets");

pub const DEFAULT_MEMFD_MARKER: &str = "jit-cache-zygiskfrida";
pub const DEFAULT_MEMFD_LABEL: &str = "jit-cache";
pub const DEFAULT_MAPS_MARKER: &str = "memfd:";

/// Markers the shims act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShimConfig {
    pub memfd_marker: CString,
    pub memfd_label: CString,
    pub maps_marker: CString,
}

impl Default for ShimConfig {
    fn default() -> Self {
        ShimConfig {
            memfd_marker: CString::new(DEFAULT_MEMFD_MARKER).unwrap_or_default(),
            memfd_label: CString::new(DEFAULT_MEMFD_LABEL).unwrap_or_default(),
            maps_marker: CString::new(DEFAULT_MAPS_MARKER).unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Markers
// ---------------------------------------------------------------------------

static SHIM_CONFIG: OnceLock<ShimConfig> = OnceLock::new();

/// Publish the markers once per process.  Returns `false` if they were
/// already set (or already read with the defaults).
pub fn install_config(config: ShimConfig) -> bool {
    SHIM_CONFIG.set(config).is_ok()
}

fn shim_config() -> &'static ShimConfig {
    SHIM_CONFIG.get_or_init(ShimConfig::default)
}

// ---------------------------------------------------------------------------
// Original function pointers
// ---------------------------------------------------------------------------

/// The original function for `slot`, falling back to the next definition in
/// link order when nothing was committed yet.
macro_rules! original {
    ($slot:expr, $ty:ty) => {{
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        static RESOLVED: AtomicBool = AtomicBool::new(false);
        match unsafe { $slot.load::<$ty>() } {
            Some(f) => Some(f),
            None => {
                if !RESOLVED.load(Ordering::Acquire) {
                    if let Some(addr) = crate::elf::resolve_next($slot.symbol()) {
                        NEXT.store(addr, Ordering::Release);
                    }
                    RESOLVED.store(true, Ordering::Release);
                }
                match NEXT.load(Ordering::Acquire) {
                    0 => None,
                    addr => Some(unsafe { std::mem::transmute::<usize, $ty>(addr) }),
                }
            }
        }
    }};
}

#[cfg(target_os = "linux")]
unsafe fn set_errno(val: c_int) {
    *libc::__errno_location() = val;
}

#[cfg(target_os = "android")]
unsafe fn set_errno(val: c_int) {
    *libc::__errno() = val;
}

// ---------------------------------------------------------------------------
// Filtering policy
// ---------------------------------------------------------------------------

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

/// `label` if `name` contains `marker`, otherwise `name` itself.
pub fn rewrite_label<'a>(name: &'a CStr, marker: &CStr, label: &'a CStr) -> &'a CStr {
    if contains(name.to_bytes(), marker.to_bytes()) {
        label
    } else {
        name
    }
}

/// Call `fetch` until it yields a line without `marker`, or null.
///
/// # Safety
///
/// Every non-null pointer `fetch` returns must point at a NUL-terminated
/// string.
pub unsafe fn next_visible_line<F>(marker: &[u8], mut fetch: F) -> *mut c_char
where
    F: FnMut() -> *mut c_char,
{
    loop {
        let line = fetch();
        if line.is_null() || !contains(CStr::from_ptr(line).to_bytes(), marker) {
            return line;
        }
    }
}

// ===========================================================================
// Shims
// ===========================================================================

/// Replacement for `memfd_create(2)`.
#[no_mangle]
pub unsafe extern "C" fn cloak_memfd_create(name: *const c_char, flags: c_uint) -> c_int {
    type MemfdCreateFn = unsafe extern "C" fn(*const c_char, c_uint) -> c_int;
    let real = match original!(ORIG_MEMFD_CREATE, MemfdCreateFn) {
        Some(f) => f,
        None => {
            set_errno(libc::ENOSYS);
            return -1;
        }
    };

    if name.is_null() {
        return real(name, flags);
    }
    let config = shim_config();
    let label = rewrite_label(CStr::from_ptr(name), &config.memfd_marker, &config.memfd_label);
    real(label.as_ptr(), flags)
}

/// Replacement for `fgets(3)`.
#[no_mangle]
pub unsafe extern "C" fn cloak_fgets(buf: *mut c_char, size: c_int, stream: *mut FILE) -> *mut c_char {
    type FgetsFn = unsafe extern "C" fn(*mut c_char, c_int, *mut FILE) -> *mut c_char;
    let real = match original!(ORIG_FGETS, FgetsFn) {
        Some(f) => f,
        None => {
            set_errno(libc::ENOSYS);
            return std::ptr::null_mut();
        }
    };

    let marker = shim_config().maps_marker.as_bytes();
    next_visible_line(marker, || real(buf, size, stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::ptr;

    /// Feeds `lines` one at a time through a C buffer, like `fgets` would.
    fn feed(lines: &[&str], marker: &str) -> Vec<String> {
        let mut storage = vec![0 as c_char; 128];
        let buf = storage.as_mut_ptr();
        let mut pending = lines.iter();
        let mut fetch = || match pending.next() {
            Some(line) => unsafe {
                ptr::copy_nonoverlapping(line.as_ptr() as *const c_char, buf, line.len());
                *buf.add(line.len()) = 0;
                buf
            },
            None => ptr::null_mut(),
        };

        let mut out = Vec::new();
        loop {
            let line = unsafe { next_visible_line(marker.as_bytes(), &mut fetch) };
            if line.is_null() {
                break;
            }
            out.push(unsafe { CStr::from_ptr(line) }.to_string_lossy().into_owned());
        }
        out
    }

    #[test]
    fn filter_skips_marked_lines() {
        assert_eq!(feed(&["a", "memfd:jit", "b"], "memfd:"), vec!["a", "b"]);
    }

    #[test]
    fn filter_reports_end_after_trailing_marked_lines() {
        assert_eq!(feed(&["a", "memfd:x", "memfd:y"], "memfd:"), vec!["a"]);
        assert!(feed(&["memfd:only"], "memfd:").is_empty());
        assert!(feed(&[], "memfd:").is_empty());
    }

    #[test]
    fn filter_matches_marker_anywhere_in_line() {
        let lines = [
            "7f00-7f10 r-xp 00000000 00:01 4096 /memfd:jit-cache (deleted)\n",
            "7f10-7f20 r--p 00000000 fd:01 77 /system/lib64/libc.so\n",
        ];
        assert_eq!(feed(&lines, "memfd:"), vec![lines[1]]);
    }

    #[test]
    fn label_is_rewritten_only_when_marked() {
        let marker = c"jit-cache-zygiskfrida";
        let label = c"jit-cache";
        assert_eq!(rewrite_label(c"jit-cache-zygiskfrida", marker, label), label);
        assert_eq!(rewrite_label(c"x-jit-cache-zygiskfrida-y", marker, label), label);
        assert_eq!(rewrite_label(c"libfoo.so", marker, label), c"libfoo.so");
        assert_eq!(rewrite_label(c"jit-cache", marker, label), c"jit-cache");
    }

    #[test]
    fn memfd_shim_creates_renamed_memfd() {
        let fd = unsafe { cloak_memfd_create(c"jit-cache-zygiskfrida".as_ptr(), libc::MFD_CLOEXEC) };
        assert!(fd >= 0);
        let link = std::fs::read_link(format!("/proc/self/fd/{}", fd)).unwrap();
        assert_eq!(link.to_string_lossy(), "/memfd:jit-cache (deleted)");
        unsafe { libc::close(fd) };

        let fd = unsafe { cloak_memfd_create(c"libfoo.so".as_ptr(), libc::MFD_CLOEXEC) };
        assert!(fd >= 0);
        let link = std::fs::read_link(format!("/proc/self/fd/{}", fd)).unwrap();
        assert_eq!(link.to_string_lossy(), "/memfd:libfoo.so (deleted)");
        unsafe { libc::close(fd) };
    }

    #[test]
    fn fgets_shim_reads_through_to_libc() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"a\nmemfd:jit\nb\n").unwrap();
        file.flush().unwrap();
        let path = CString::new(file.path().to_str().unwrap()).unwrap();

        unsafe {
            let stream = libc::fopen(path.as_ptr(), c"r".as_ptr());
            assert!(!stream.is_null());
            let mut buf = [0 as c_char; 64];
            let mut lines = Vec::new();
            while !cloak_fgets(buf.as_mut_ptr(), buf.len() as c_int, stream).is_null() {
                lines.push(CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned());
            }
            libc::fclose(stream);
            assert_eq!(lines, vec!["a\n", "b\n"]);
        }
    }
}
