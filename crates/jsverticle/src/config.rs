//! Process-wide configuration toggles.
//!
//! Both toggles are environment variables whose mere presence switches the
//! behaviour, whatever their value. They are read once per process by
//! [`BridgeSettings::global`] and never re-read.

use std::ffi::OsString;
use std::sync::OnceLock;

/// When set, the embedded engine gets no `process` global.
///
/// By default an empty `process` object with an `env` property is defined
/// because libraries written for Node.js (React among them) refuse to run
/// without it.
pub const DISABLE_PROCESS_ENV_VAR: &str = "VERTX_DISABLE_NODEJS_PROCESS_ENV";

/// When set, package-style components may be routed to the isolated runtime.
pub const ENABLE_NODE_PACKAGES_VAR: &str = "VERTX_ENABLE_NODEJS_VERTICLES";

static GLOBAL: OnceLock<BridgeSettings> = OnceLock::new();

/// Resolved configuration toggles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Define `process.env` in the embedded engine.
    pub process_env_shim: bool,
    /// Allow isolated-runtime dispatch for package-style components.
    pub node_packages: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            process_env_shim: true,
            node_packages: false,
        }
    }
}

impl BridgeSettings {
    /// Resolve settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        Self {
            process_env_shim: lookup(DISABLE_PROCESS_ENV_VAR).is_none(),
            node_packages: lookup(ENABLE_NODE_PACKAGES_VAR).is_some(),
        }
    }

    /// Resolve settings from the current process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var_os(name))
    }

    /// Settings for this process, read from the environment on first use.
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(|| {
            let settings = Self::from_env();
            log::debug!(
                "bridge settings: process.env shim {}, node packages {}",
                on_off(settings.process_env_shim),
                on_off(settings.node_packages)
            );
            settings
        })
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}
