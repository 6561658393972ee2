use std::io;

use thiserror::Error;

use crate::maps::Perms;

/// Why a single range could not be remapped.
#[derive(Debug, Error)]
pub enum RemapError {
    #[error("failed to allocate {len:#x} bytes of scratch memory: {source}")]
    Allocate { len: usize, source: io::Error },

    #[error("failed to relocate scratch memory onto {target:#x}: {source}")]
    Relocate { target: usize, source: io::Error },

    #[error("failed to set {perms} on {addr:#x}+{len:#x}: {source}")]
    Protect {
        addr: usize,
        len: usize,
        perms: Perms,
        source: io::Error,
    },
}
