//! The component factory: chooses between the embedded engine and the
//! isolated runtime for each component.

use crate::capability::IsolationSupport;
use crate::component::{Component, ComponentFactory, EmbeddedComponent};
use crate::config::BridgeSettings;
use crate::engine::ScriptEngine;
use crate::environment;
use crate::error::Result;
use crate::host::HostSystem;
use crate::isolated::IsolatedComponent;
use crate::package::{self, PackageKind};
use crate::resources::{ResourceLoader, strip_prefix};
use crate::sandbox::{SandboxEnvironment, ScriptOptions};
use std::sync::Arc;

/// Deployment scheme handled by [`JsComponentFactory`].
pub const PREFIX: &str = "js";

enum EngineSource {
    /// The process-wide engine, bootstrapped on first use.
    Shared(Arc<dyn HostSystem>),
    Fixed(ScriptEngine),
}

pub struct JsComponentFactory {
    engine: EngineSource,
    isolation: Arc<IsolationSupport>,
    sandbox: SandboxEnvironment,
    script_options: ScriptOptions,
}

impl JsComponentFactory {
    /// A factory using the process-wide engine and process-wide settings.
    pub fn new(host: Arc<dyn HostSystem>) -> Self {
        Self {
            engine: EngineSource::Shared(host),
            isolation: IsolationSupport::global(),
            sandbox: SandboxEnvironment::new(),
            script_options: ScriptOptions {
                process_env: BridgeSettings::global().process_env_shim,
                ..ScriptOptions::default()
            },
        }
    }

    /// A factory bound to an engine the caller bootstrapped.
    pub fn with_engine(engine: ScriptEngine) -> Self {
        Self {
            engine: EngineSource::Fixed(engine),
            isolation: Arc::new(IsolationSupport::disabled()),
            sandbox: SandboxEnvironment::new(),
            script_options: ScriptOptions::default(),
        }
    }

    pub fn with_isolation(mut self, isolation: Arc<IsolationSupport>) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxEnvironment, options: ScriptOptions) -> Self {
        self.sandbox = sandbox;
        self.script_options = options;
        self
    }

    fn engine(&self) -> Result<ScriptEngine> {
        match &self.engine {
            EngineSource::Shared(host) => environment::ensure_ready(host),
            EngineSource::Fixed(engine) => Ok(engine.clone()),
        }
    }
}

impl ComponentFactory for JsComponentFactory {
    fn prefix(&self) -> &'static str {
        PREFIX
    }

    fn blocking_create(&self) -> bool {
        true
    }

    fn create_component(
        &self,
        name: &str,
        loader: Arc<dyn ResourceLoader>,
    ) -> Result<Box<dyn Component>> {
        let engine = self.engine()?;
        let name = strip_prefix(name);

        if self.isolation.is_available() && loader.is_isolating() {
            if let PackageKind::Package { root } = package::detect(loader.as_ref()) {
                log::info!("Starting isolated component {name} from {}", root.display());
                let component = IsolatedComponent::new(
                    &self.sandbox,
                    name,
                    &root,
                    Some(self.script_options.clone()),
                )?;
                return Ok(Box::new(component));
            }
        }

        log::debug!("creating embedded component {name} from {}", loader.describe());
        Ok(Box::new(EmbeddedComponent::new(engine, name, loader)))
    }
}
