//! Rewrites this test binary's own bindings, so everything runs in one test
//! function: commit is a one-way, process-wide step.

use std::ffi::{CStr, CString};
use std::io::Write;

use cloak_hooks::got::GotPatcher;
use cloak_hooks::shims::{ORIG_FGETS, ORIG_MEMFD_CREATE};
use cloak_hooks::{CloakModule, Config, HookError};
use libc::{c_char, c_int, FILE};

type FgetsFn = unsafe extern "C" fn(*mut c_char, c_int, *mut FILE) -> *mut c_char;

// Kept out of line so every call reloads the binding.
#[inline(never)]
fn memfd_link(name: &CStr) -> String {
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    assert!(fd >= 0, "memfd_create failed");
    let link = std::fs::read_link(format!("/proc/self/fd/{}", fd)).unwrap();
    unsafe { libc::close(fd) };
    link.to_string_lossy().into_owned()
}

#[inline(never)]
fn read_lines_libc(path: &CStr) -> Vec<String> {
    read_lines(path, libc::fgets)
}

fn read_lines(path: &CStr, fgets: FgetsFn) -> Vec<String> {
    let mut lines = Vec::new();
    unsafe {
        let stream = libc::fopen(path.as_ptr(), c"r".as_ptr());
        assert!(!stream.is_null());
        let mut buf = [0 as c_char; 128];
        while !fgets(buf.as_mut_ptr(), buf.len() as c_int, stream).is_null() {
            lines.push(CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned());
        }
        libc::fclose(stream);
    }
    lines
}

#[test]
fn committed_hooks_intercept_calls_from_loaded_code() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"a\n7f00-7f10 r-xp 00000000 00:01 9 /memfd:jit-cache (deleted)\nb\n")
        .unwrap();
    file.flush().unwrap();
    let path = CString::new(file.path().to_str().unwrap()).unwrap();

    // Before commit every call reaches libc unchanged.
    assert_eq!(read_lines_libc(&path).len(), 3);
    assert_eq!(
        memfd_link(c"jit-cache-zygiskfrida"),
        "/memfd:jit-cache-zygiskfrida (deleted)"
    );

    let mut module = CloakModule::new(Config::default(), GotPatcher::new());
    let summary = module.on_load().unwrap();
    assert!(summary.resolved.contains(&"fgets".to_string()));
    assert!(summary.resolved.contains(&"memfd_create".to_string()));
    assert!(ORIG_FGETS.get().is_some());
    assert!(ORIG_MEMFD_CREATE.get().is_some());

    // Marked memfd labels are replaced, others pass through.
    assert_eq!(memfd_link(c"jit-cache-zygiskfrida"), "/memfd:jit-cache (deleted)");
    assert_eq!(memfd_link(c"libfoo.so"), "/memfd:libfoo.so (deleted)");

    // Lines mentioning memfd mappings disappear from fgets readers.
    assert_eq!(read_lines_libc(&path), vec!["a\n", "b\n"]);

    // The original slot still behaves like the real fgets.
    let original = unsafe { ORIG_FGETS.load::<FgetsFn>() }.unwrap();
    assert_eq!(read_lines(&path, original).len(), 3);

    // Bindings are final.
    assert!(matches!(module.on_load(), Err(HookError::AlreadyCommitted)));
}
