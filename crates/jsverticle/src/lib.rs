//! jsverticle: JavaScript components for a host component framework.
//!
//! Components are JavaScript modules. Most run in one shared, embedded
//! QuickJS engine that is prepared once per process to look like the
//! environment component scripts expect (`require`, `vertx`, `console`,
//! timers, `process.env`). Components packaged as Node-style packages can
//! instead run in an isolated runtime of their own.
//!
//! # Flow
//!
//! ```text
//! host ── create_component(name, loader) ──► JsComponentFactory
//!                                               │
//!                  ┌── package-style? (package::detect) ──┐
//!                  ▼                                       ▼
//!          EmbeddedComponent                      IsolatedComponent
//!   (shared ScriptEngine, hooks)           (SandboxScript on its own thread)
//! ```
//!
//! # Modules
//!
//! - `engine`: QuickJS bootstrap, bindings and hook invocation
//! - `environment`: the process-wide engine
//! - `component`: host-facing traits and the embedded component
//! - `factory`: dispatch between embedded and isolated components
//! - `package`: package-style detection
//! - `sandbox` / `isolated`: the isolated runtime and its component
//! - `capability`: one-time isolated runtime probe
//! - `resources` / `archive`: loading contexts
//! - `host`: timer services consumed from the host
//! - `completion`: lifecycle completion tokens
//! - `config`: environment toggles
//! - `error`: error types

pub mod archive;
pub mod capability;
pub mod completion;
pub mod component;
pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod factory;
pub mod host;
pub mod isolated;
pub mod package;
pub mod resources;
pub mod sandbox;

pub use archive::{ArchiveBuilder, ArchiveLoader};
pub use capability::{CapabilityProbe, IsolationSupport, Requirement};
pub use completion::{Completion, LifecycleFuture, Outcome, completion};
pub use component::{
    Component, ComponentFactory, ComponentKind, ComponentState, EmbeddedComponent, HookPresence,
    LifecycleHook, Phase,
};
pub use config::BridgeSettings;
pub use engine::{EngineOptions, EnvironmentSource, Exports, ModuleRoot, ScriptEngine};
pub use error::{Error, Result};
pub use factory::JsComponentFactory;
pub use host::{HostSystem, ThreadedHost, TimerHandler, TimerId, TimerQueue};
pub use isolated::IsolatedComponent;
pub use package::PackageKind;
pub use resources::{BundledResources, DirectoryLoader, EntryInfo, MemoryLoader, ResourceLoader};
pub use sandbox::{SandboxEnvironment, SandboxLimits, SandboxScript, ScriptFuture, ScriptOptions, ScriptStatus};
