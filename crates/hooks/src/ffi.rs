//! C entry points for the host.
//!
//! The host keeps the module for the process lifetime; there is no teardown
//! call because committed bindings cannot be undone.

use std::ffi::{CStr, CString};
use std::sync::{LazyLock, Mutex};

use cloak_remap::Remapper;
use libc::{c_char, c_void, size_t};
use log::{error, info, warn};

use crate::config::Config;
use crate::got::GotPatcher;
use crate::host::{HostBackend, HostPltApi};
use crate::logger;
use crate::module::{CloakModule, Injection, Injector};
use crate::registry::PltBackend;

type Backend = Box<dyn PltBackend + Send>;

static MODULE: LazyLock<Mutex<Option<CloakModule<Backend>>>> = LazyLock::new(|| Mutex::new(None));

/// Injection decision supplied by the host.
///
/// Returns whether a library was injected for `identity`; if so its path is
/// written NUL-terminated into `library`, which holds `library_len` bytes.
pub type InjectFn = unsafe extern "C" fn(
    identity: *const c_char,
    library: *mut c_char,
    library_len: size_t,
    user: *mut c_void,
) -> bool;

struct CallbackInjector {
    decide: Option<InjectFn>,
    user: *mut c_void,
}

impl Injector for CallbackInjector {
    fn inject(&mut self, identity: &str) -> Injection {
        let Some(decide) = self.decide else {
            return Injection::Declined;
        };
        let Ok(identity) = CString::new(identity) else {
            return Injection::Declined;
        };
        let mut library = vec![0 as c_char; libc::PATH_MAX as usize];
        if !unsafe { decide(identity.as_ptr(), library.as_mut_ptr(), library.len(), self.user) } {
            return Injection::Declined;
        }
        if let Some(last) = library.last_mut() {
            *last = 0;
        }
        let library = unsafe { CStr::from_ptr(library.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        if library.is_empty() {
            warn!("injection reported without a library path");
        }
        Injection::Injected { library }
    }
}

fn new_module(api: *const HostPltApi) -> CloakModule<Backend> {
    let backend: Backend = match unsafe { api.as_ref() } {
        Some(api) => Box::new(HostBackend::new(api)),
        None => Box::new(GotPatcher::new()),
    };
    CloakModule::new(Config::from_env(), backend)
}

/// Attach: install the logger and commit the shims.
///
/// With a null `api` bindings are rewritten in-process; otherwise `api` must
/// stay valid for the process lifetime.  Returns `false` if the shims could
/// not be committed or the module was already loaded.
#[no_mangle]
pub unsafe extern "C" fn cloak_on_load(api: *const HostPltApi) -> bool {
    logger::init();
    let Ok(mut slot) = MODULE.lock() else {
        return false;
    };
    if slot.is_some() {
        warn!("cloak_on_load called twice");
        return false;
    }

    let mut module = new_module(api);
    let loaded = match module.on_load() {
        Ok(summary) => {
            info!("loaded, {} bindings rewritten", summary.rewritten);
            true
        }
        Err(err) => {
            error!("failed to install hooks: {}", err);
            false
        }
    };
    *slot = Some(module);
    loaded
}

/// Specialization checkpoint.  Returns `false` when the host should unload
/// this module from the process.
#[no_mangle]
pub unsafe extern "C" fn cloak_on_specialize(
    identity: *const c_char,
    decide: Option<InjectFn>,
    user: *mut c_void,
) -> bool {
    if identity.is_null() {
        return false;
    }
    let identity = CStr::from_ptr(identity).to_string_lossy();

    // The host's callback may call back into `cloak_remap`, so the decision
    // is taken without holding the module.
    let injection = CallbackInjector { decide, user }.inject(&identity);

    let Ok(slot) = MODULE.lock() else {
        return false;
    };
    match slot.as_ref() {
        Some(module) => module.apply_injection(&identity, injection),
        None => {
            warn!("specialized before load");
            new_module(std::ptr::null()).apply_injection(&identity, injection)
        }
    }
}

/// Remap every mapping of the library at `path`.  Returns `true` when all of
/// them were remapped, or none was mapped.
#[no_mangle]
pub unsafe extern "C" fn cloak_remap(path: *const c_char) -> bool {
    if path.is_null() {
        return false;
    }
    let path = CStr::from_ptr(path).to_string_lossy();
    let report = match MODULE.lock() {
        Ok(slot) => match slot.as_ref() {
            Some(module) => module.remap(&path),
            None => Remapper::default().remap(&path),
        },
        Err(_) => return false,
    };
    report.is_complete()
}
