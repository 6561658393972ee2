//! Lifecycle glue between the host and the stealth mechanisms.
//!
//! The host calls [`CloakModule::on_load`] once when it attaches this library
//! and [`CloakModule::on_specialize`] once the process has taken on its
//! application identity.

use cloak_remap::{RemapReport, Remapper};
use log::{debug, error, info};

use crate::config::Config;
use crate::error::HookError;
use crate::registry::{CommitSummary, HookRegistry, ObjectMatcher, PltBackend};
use crate::shims;

/// Outcome of the injection decision for one process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Injection {
    Declined,
    /// A library was loaded from `library`.
    Injected { library: String },
}

/// Decides whether a process gets the payload, and loads it if so.
pub trait Injector {
    fn inject(&mut self, identity: &str) -> Injection;
}

impl<F> Injector for F
where
    F: FnMut(&str) -> Injection,
{
    fn inject(&mut self, identity: &str) -> Injection {
        self(identity)
    }
}

pub struct CloakModule<B> {
    config: Config,
    hooks: HookRegistry<B>,
    remapper: Remapper,
}

impl<B: PltBackend> CloakModule<B> {
    pub fn new(config: Config, backend: B) -> Self {
        let remapper = Remapper::new(config.failure_policy);
        CloakModule {
            config,
            hooks: HookRegistry::new(backend),
            remapper,
        }
    }

    /// Install the `memfd_create` and `fgets` shims across every loaded
    /// object.  Runs before application code can cache the real addresses.
    pub fn on_load(&mut self) -> Result<CommitSummary, HookError> {
        if !shims::install_config(self.config.shim_config()) {
            debug!("shim markers were already set");
        }
        self.hooks.register(
            ObjectMatcher::All,
            "memfd_create",
            shims::cloak_memfd_create as usize,
            &shims::ORIG_MEMFD_CREATE,
        )?;
        self.hooks.register(
            ObjectMatcher::All,
            "fgets",
            shims::cloak_fgets as usize,
            &shims::ORIG_FGETS,
        )?;
        let summary = self.hooks.commit()?;
        info!(
            "hooks committed: resolved {:?}, missing {:?}",
            summary.resolved, summary.missing
        );
        Ok(summary)
    }

    /// Ask `injector` whether `identity` gets the payload and hide whatever it
    /// loaded.  Returns `false` when the host should unload this module.
    pub fn on_specialize<I>(&mut self, identity: &str, injector: &mut I) -> bool
    where
        I: Injector + ?Sized,
    {
        let injection = injector.inject(identity);
        self.apply_injection(identity, injection)
    }

    /// Second half of [`on_specialize`](Self::on_specialize), for callers
    /// that must not hold the module while the injector runs.
    ///
    /// Libraries listed in [`Config::harden_libraries`] are remapped either
    /// way.
    pub fn apply_injection(&self, identity: &str, injection: Injection) -> bool {
        let keep = match injection {
            Injection::Injected { library } => {
                info!("Injected {} into {}", library, identity);
                self.remap(&library);
                true
            }
            Injection::Declined => {
                debug!("nothing injected into {}", identity);
                false
            }
        };
        for library in &self.config.harden_libraries {
            self.remap(library);
        }
        keep
    }

    /// Remap `library` with the configured failure policy.
    pub fn remap(&self, library: &str) -> RemapReport {
        let report = self.remapper.remap(library);
        if !report.is_complete() {
            error!(
                "{}: remapped {} of {} ranges",
                report.library,
                report.remapped.len(),
                report.matched
            );
        }
        report
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hooks(&self) -> &HookRegistry<B> {
        &self.hooks
    }
}
