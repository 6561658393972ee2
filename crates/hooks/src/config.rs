//! Runtime configuration, read once from `CLOAK_*` environment variables.

use std::ffi::CString;

use cloak_remap::FailurePolicy;
use log::warn;

use crate::shims::{ShimConfig, DEFAULT_MAPS_MARKER, DEFAULT_MEMFD_LABEL, DEFAULT_MEMFD_MARKER};

pub const MEMFD_MARKER_ENV: &str = "CLOAK_MEMFD_MARKER";
pub const MEMFD_LABEL_ENV: &str = "CLOAK_MEMFD_LABEL";
pub const MAPS_MARKER_ENV: &str = "CLOAK_MAPS_MARKER";
pub const REMAP_POLICY_ENV: &str = "CLOAK_REMAP_POLICY";
/// `:`-separated library paths remapped at every specialization.
pub const HARDEN_ENV: &str = "CLOAK_HARDEN";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Substring of a memfd name that identifies the injected component.
    pub memfd_marker: String,
    /// Name such memfds are created with instead.
    pub memfd_label: String,
    /// Lines read through `fgets` that contain this are dropped.
    pub maps_marker: String,
    pub failure_policy: FailurePolicy,
    /// Libraries remapped whether or not anything was injected.
    pub harden_libraries: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            memfd_marker: DEFAULT_MEMFD_MARKER.to_string(),
            memfd_label: DEFAULT_MEMFD_LABEL.to_string(),
            maps_marker: DEFAULT_MAPS_MARKER.to_string(),
            failure_policy: FailurePolicy::default(),
            harden_libraries: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from `lookup`, keeping the default for every key that
    /// is unset, empty or invalid.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let marker = |key: &str, current: &mut String| {
            if let Some(value) = lookup(key) {
                if value.is_empty() || value.contains('\0') {
                    warn!("ignoring {}: empty or contains NUL", key);
                } else {
                    *current = value;
                }
            }
        };
        marker(MEMFD_MARKER_ENV, &mut config.memfd_marker);
        marker(MEMFD_LABEL_ENV, &mut config.memfd_label);
        marker(MAPS_MARKER_ENV, &mut config.maps_marker);

        if let Some(policy) = lookup(REMAP_POLICY_ENV) {
            match policy.as_str() {
                "stop" => config.failure_policy = FailurePolicy::StopOnFirstFailure,
                "continue" => config.failure_policy = FailurePolicy::ContinueOnFailure,
                other => warn!("ignoring {}={:?}: expected stop or continue", REMAP_POLICY_ENV, other),
            }
        }

        if let Some(paths) = lookup(HARDEN_ENV) {
            config.harden_libraries = paths
                .split(':')
                .filter(|path| !path.is_empty())
                .map(str::to_string)
                .collect();
        }
        config
    }

    pub fn shim_config(&self) -> ShimConfig {
        let defaults = ShimConfig::default();
        ShimConfig {
            memfd_marker: CString::new(self.memfd_marker.as_str()).unwrap_or(defaults.memfd_marker),
            memfd_label: CString::new(self.memfd_label.as_str()).unwrap_or(defaults.memfd_label),
            maps_marker: CString::new(self.maps_marker.as_str()).unwrap_or(defaults.maps_marker),
        }
    }
}
