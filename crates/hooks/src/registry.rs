//! Registration and one-shot commit of intercepted symbols.
//!
//! Entries are queued with [`HookRegistry::register`] and take effect together
//! on [`HookRegistry::commit`].  After the commit the registry is closed for
//! the rest of the process: committed bindings cannot be undone.  The actual
//! rewriting is done by a [`PltBackend`], so the registry itself can be
//! exercised without patching a live binary.

use std::ffi::CString;

use log::debug;

use crate::error::HookError;
use crate::slot::HookSlot;

/// Which loaded objects a hook applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectMatcher {
    /// Every loaded object, the main program included.
    All,
    /// Objects whose path equals the name or ends in `/<name>`.
    Named(String),
}

impl ObjectMatcher {
    pub fn matches(&self, object_path: &str) -> bool {
        match self {
            ObjectMatcher::All => true,
            ObjectMatcher::Named(name) => {
                !name.is_empty()
                    && (object_path == name
                        || object_path.rsplit('/').next() == Some(name.as_str()))
            }
        }
    }

    /// The equivalent regular expression for hosts that select objects by
    /// matching their path against a pattern.
    pub fn host_pattern(&self) -> String {
        match self {
            ObjectMatcher::All => ".*".to_string(),
            ObjectMatcher::Named(name) => format!("(^|.*/){}$", escape_regex(name)),
        }
    }
}

fn escape_regex(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// One registered hook.
#[derive(Debug)]
pub struct InterceptionEntry {
    pub target: ObjectMatcher,
    pub symbol: CString,
    /// Address of the replacement function.
    pub replacement: usize,
    /// Receives the address of the implementation being replaced.
    pub original: &'static HookSlot,
}

impl InterceptionEntry {
    pub fn symbol_name(&self) -> String {
        self.symbol.to_string_lossy().into_owned()
    }
}

/// What a commit managed to bind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Symbols with at least one rewritten binding.
    pub resolved: Vec<String>,
    /// Symbols no selected object imports.
    pub missing: Vec<String>,
    /// Total number of binding slots rewritten, when the backend knows it.
    pub rewritten: usize,
}

/// Something that can rewrite symbol bindings for a batch of entries.
pub trait PltBackend {
    /// Rewrite every binding named by `entries` and fill their original
    /// slots.  A symbol that no selected object imports is not an error.
    fn commit(&mut self, entries: &[InterceptionEntry]) -> Result<CommitSummary, HookError>;
}

impl<B: PltBackend + ?Sized> PltBackend for Box<B> {
    fn commit(&mut self, entries: &[InterceptionEntry]) -> Result<CommitSummary, HookError> {
        (**self).commit(entries)
    }
}

/// Process-scoped owner of all hook registrations.
pub struct HookRegistry<B> {
    backend: B,
    entries: Vec<InterceptionEntry>,
    committed: bool,
}

impl<B: PltBackend> HookRegistry<B> {
    pub fn new(backend: B) -> Self {
        HookRegistry {
            backend,
            entries: Vec::new(),
            committed: false,
        }
    }

    /// Queue a hook.  Nothing is rewritten until [`commit`](Self::commit).
    pub fn register(
        &mut self,
        target: ObjectMatcher,
        symbol: &str,
        replacement: usize,
        original: &'static HookSlot,
    ) -> Result<(), HookError> {
        if self.committed {
            return Err(HookError::AlreadyCommitted);
        }
        let symbol = CString::new(symbol).map_err(|_| HookError::InvalidName(symbol.to_string()))?;
        debug!("register {:?} in {:?}", symbol, target);
        self.entries.push(InterceptionEntry {
            target,
            symbol,
            replacement,
            original,
        });
        Ok(())
    }

    /// Rewrite the bindings of every queued entry in one pass.
    ///
    /// The registry is closed afterwards even if the backend failed, since a
    /// partial commit cannot be rolled back.
    pub fn commit(&mut self) -> Result<CommitSummary, HookError> {
        if self.committed {
            return Err(HookError::AlreadyCommitted);
        }
        self.committed = true;
        let summary = self.backend.commit(&self.entries)?;
        for symbol in &summary.missing {
            debug!("no binding found for {}", symbol);
        }
        Ok(summary)
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn entries(&self) -> &[InterceptionEntry] {
        &self.entries
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}
