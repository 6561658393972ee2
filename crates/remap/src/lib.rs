//! In-process stealth hardening of memory mappings.
//!
//! [`maps`] reads the process's own memory-map listing and picks out the
//! ranges that belong to a named module.  [`remapper`] then rewrites each of
//! those ranges so it is backed by fresh anonymous memory with identical
//! content, address and protection: afterwards the listing shows an ordinary
//! anonymous mapping where the module's file used to be.
//!
//! Everything here is best effort.  Failures are logged and reported, never
//! raised as panics, because the caller lives inside a host process it must
//! not bring down.

pub mod error;
pub mod maps;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod region;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod remapper;

pub use error::RemapError;
pub use maps::{MapRecord, Perms};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use remapper::{remap, FailurePolicy, RangeFailure, RemapReport, Remapper};
