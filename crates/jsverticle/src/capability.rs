//! One-time check that the isolated runtime can be used in this process.

use crate::config::BridgeSettings;
use crate::engine::{EngineOptions, ScriptEngine};
use crate::host::TimerQueue;
use crate::resources::{BundledResources, NODE_COMPAT, ResourceLoader};
use crate::sandbox::SandboxLimits;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Version of the Node compatibility layer this crate drives.
pub const COMPAT_VERSION: &str = "1";

const DISABLING: &str = "Disabling resolution of node.js packages";

type Check = Box<dyn Fn() -> Result<(), String> + Send + Sync>;

/// Something the isolated runtime needs.
pub struct Requirement {
    name: String,
    check: Check,
}

impl Requirement {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Box::new(check),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requirement")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// An ordered list of requirements, checked until the first one fails.
///
/// Embedders add their own checks with [`CapabilityProbe::with_requirement`],
/// for instance that the directory packages are extracted to is writable.
#[derive(Debug, Default)]
pub struct CapabilityProbe {
    requirements: Vec<Requirement>,
}

impl CapabilityProbe {
    /// No requirements; always passes.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The requirements of the built-in isolated runtime.
    ///
    /// The first builds what every isolated script gets: an event loop and a
    /// runtime bootstrapped under the default [`SandboxLimits`], which must
    /// then load the compatibility layer through its module loader. The
    /// second pins the layer's version.
    pub fn standard() -> Self {
        Self::empty()
            .with_requirement(Requirement::new(
                "isolated script runtime",
                check_sandbox_runtime,
            ))
            .with_requirement(Requirement::new(
                format!("node compatibility layer {COMPAT_VERSION}"),
                || check_compat_version(&bundled_source(NODE_COMPAT)?),
            ))
    }

    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// Check every requirement in order. On the first failure, log it and
    /// return `false`.
    pub fn run(&self) -> bool {
        for requirement in &self.requirements {
            if let Err(reason) = (requirement.check)() {
                log::warn!("{} is missing: {reason}", requirement.name());
                log::warn!("{DISABLING}");
                return false;
            }
        }
        true
    }
}

fn check_sandbox_runtime() -> Result<(), String> {
    let limits = SandboxLimits::default();
    let queue = TimerQueue::new().map_err(|err| format!("no event loop: {err}"))?;
    let options = EngineOptions {
        process_env: false,
        memory_limit: Some(limits.max_memory_bytes),
        max_stack_size: Some(limits.max_stack_bytes),
        ..EngineOptions::default()
    };
    let engine = ScriptEngine::bootstrap(Arc::new(queue), Arc::new(BundledResources), options)
        .map_err(|err| err.to_string())?;
    let kind = engine
        .eval_json("typeof require('vertx-js/node/compat')")
        .map_err(|err| err.to_string())?;
    if kind != "function" {
        return Err(format!("compatibility layer exports {kind}, not a function"));
    }
    Ok(())
}

fn bundled_source(name: &str) -> Result<String, String> {
    let bytes = BundledResources
        .read(name)
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("{name} not found"))?;
    String::from_utf8(bytes).map_err(|err| err.to_string())
}

fn check_compat_version(source: &str) -> Result<(), String> {
    let expected = format!("// vertx-js node compat {COMPAT_VERSION}");
    match source.lines().next() {
        Some(line) if line.trim() == expected => Ok(()),
        Some(line) => Err(format!("expected `{expected}`, found `{}`", line.trim())),
        None => Err("empty compatibility layer".to_string()),
    }
}

/// Whether package-style components may go to the isolated runtime.
///
/// Requires the configuration toggle and a passing probe. The probe runs at
/// most once per instance; its result is never revisited.
pub struct IsolationSupport {
    enabled: bool,
    probe: CapabilityProbe,
    result: OnceLock<bool>,
}

impl IsolationSupport {
    pub fn new(enabled: bool, probe: CapabilityProbe) -> Self {
        Self {
            enabled,
            probe,
            result: OnceLock::new(),
        }
    }

    /// Isolation turned off.
    pub fn disabled() -> Self {
        Self::new(false, CapabilityProbe::empty())
    }

    pub fn is_available(&self) -> bool {
        self.enabled && *self.result.get_or_init(|| self.probe.run())
    }

    /// The process-wide instance, configured from [`BridgeSettings::global`]
    /// with the standard probe.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<IsolationSupport>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| {
            Arc::new(Self::new(
                BridgeSettings::global().node_packages,
                CapabilityProbe::standard(),
            ))
        }))
    }
}

impl fmt::Debug for IsolationSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationSupport")
            .field("enabled", &self.enabled)
            .field("probed", &self.result.get())
            .finish_non_exhaustive()
    }
}
