//! Injectable library that hides an instrumentation payload from in-process
//! introspection.
//!
//! At load time it rewrites the bindings every loaded object holds for
//! `memfd_create` and `fgets` (see [`registry`] and [`shims`]):
//!
//! * memfds whose label names the payload are created under a generic label;
//! * any text read through `fgets` loses lines mentioning memfd mappings,
//!   which covers the usual `/proc/self/maps` scanners.
//!
//! Once the process has its application identity, the injected library's
//! mappings are moved onto anonymous memory with [`cloak_remap`], so the
//! listing no longer names its file.
//!
//! ## Bindings
//!
//! A host that already owns a PLT hook facility passes it in as a
//! [`HostPltApi`](host::HostPltApi) vtable.  Without one, [`got::GotPatcher`]
//! walks the loaded objects with `dl_iterate_phdr` and rewrites their GOT
//! slots directly.  Code that resolves symbols through other means (its own
//! `dlsym`, raw syscalls) is not affected.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("cloak-hooks only supports Linux and Android");

pub mod config;
pub mod elf;
pub mod error;
pub mod ffi;
pub mod got;
pub mod host;
pub mod logger;
pub mod module;
pub mod registry;
pub mod shims;
pub mod slot;

pub use config::Config;
pub use error::HookError;
pub use module::{CloakModule, Injection, Injector};
pub use registry::{CommitSummary, HookRegistry, InterceptionEntry, ObjectMatcher, PltBackend};
pub use slot::HookSlot;
