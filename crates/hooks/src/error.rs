use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    /// Bindings are rewritten once per process; nothing can be added or
    /// committed afterwards.
    #[error("hooks were already committed")]
    AlreadyCommitted,

    #[error("invalid name {0:?}: contains a NUL byte")]
    InvalidName(String),

    #[error("host rejected the hook commit")]
    HostRejectedCommit,
}
