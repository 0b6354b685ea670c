//! Component lifecycle: the host-facing traits and the embedded component.

use crate::completion::Completion;
use crate::engine::{Exports, ModuleRoot, ScriptEngine};
use crate::error::{Error, Result};
use crate::resources::ResourceLoader;
use std::fmt;
use std::sync::Arc;

/// A deployable unit driven by the host.
///
/// `start` and `stop` either resolve the completion token (now or later) and
/// return `Ok`, or return `Err` and leave the token unresolved. The host
/// treats an `Err` as a failed deployment regardless of the token.
pub trait Component: Send {
    fn start(&mut self, completion: Completion) -> Result<()>;

    fn stop(&mut self, completion: Completion) -> Result<()>;

    fn kind(&self) -> ComponentKind;
}

/// Creates components for deployment identifiers carrying [`ComponentFactory::prefix`].
pub trait ComponentFactory: Send + Sync {
    /// Scheme token this factory is registered under.
    fn prefix(&self) -> &'static str;

    /// Whether the host must call [`ComponentFactory::create_component`] on a
    /// worker thread rather than its event thread.
    fn blocking_create(&self) -> bool;

    /// `name` has the scheme prefix already stripped.
    fn create_component(
        &self,
        name: &str,
        loader: Arc<dyn ResourceLoader>,
    ) -> Result<Box<dyn Component>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentKind {
    Embedded,
    Isolated,
}

/// The exported functions a component may provide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleHook {
    Start,
    StartAsync,
    Stop,
    StopAsync,
}

impl LifecycleHook {
    pub fn export_name(self) -> &'static str {
        match self {
            Self::Start => "vertxStart",
            Self::StartAsync => "vertxStartAsync",
            Self::Stop => "vertxStop",
            Self::StopAsync => "vertxStopAsync",
        }
    }

    pub fn is_async(self) -> bool {
        matches!(self, Self::StartAsync | Self::StopAsync)
    }
}

/// Result of looking up a hook on an exported surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPresence {
    Present,
    Absent,
}

/// One direction of the lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Start,
    Stop,
}

impl Phase {
    /// Hooks to probe, in priority order.
    pub fn candidates(self) -> [LifecycleHook; 2] {
        match self {
            Self::Start => [LifecycleHook::Start, LifecycleHook::StartAsync],
            Self::Stop => [LifecycleHook::Stop, LifecycleHook::StopAsync],
        }
    }

    fn operation(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentState {
    Created,
    Started,
    Stopped,
    Failed,
}

impl ComponentState {
    fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// A component evaluated in the shared embedded engine.
///
/// While started, its loader is a module root of the engine. The root is
/// released on `stop`, on a failed `start`, and when the component is dropped.
pub struct EmbeddedComponent {
    exports: Option<Exports>,
    engine: ScriptEngine,
    name: String,
    loader: Arc<dyn ResourceLoader>,
    root: Option<ModuleRoot>,
    state: ComponentState,
}

impl EmbeddedComponent {
    pub fn new(engine: ScriptEngine, name: &str, loader: Arc<dyn ResourceLoader>) -> Self {
        Self {
            exports: None,
            engine,
            name: name.to_string(),
            loader,
            root: None,
            state: ComponentState::Created,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    fn check_state(&self, phase: Phase, expected: ComponentState) -> Result<()> {
        if self.state == expected {
            return Ok(());
        }
        Err(Error::InvalidState {
            name: self.name.clone(),
            operation: phase.operation(),
            state: self.state.label(),
        })
    }

    /// Probe, then take exactly one of the three paths.
    fn run_phase(&self, exports: &Exports, phase: Phase, completion: Completion) -> Result<()> {
        let [sync_hook, async_hook] = phase.candidates();
        if self.engine.probe(exports, sync_hook)? == HookPresence::Present {
            log::debug!("{}: invoking {}", self.name, sync_hook.export_name());
            self.engine.invoke(exports, sync_hook)?;
            completion.complete();
        } else if self.engine.probe(exports, async_hook)? == HookPresence::Present {
            log::debug!("{}: invoking {}", self.name, async_hook.export_name());
            self.engine
                .invoke_with_completion(exports, async_hook, completion)?;
        } else {
            completion.complete();
        }
        Ok(())
    }

    fn release_root(&mut self) {
        if let Some(root) = self.root.take() {
            self.engine.remove_module_root(root);
        }
    }

    fn start_inner(&mut self, completion: Completion) -> Result<()> {
        let root = self.engine.add_module_root(Arc::clone(&self.loader));
        self.root = Some(root);
        let exports = self.engine.require_fresh(root, &self.name, true)?;
        let result = self.run_phase(&exports, Phase::Start, completion);
        self.exports = Some(exports);
        result
    }
}

impl Component for EmbeddedComponent {
    fn start(&mut self, completion: Completion) -> Result<()> {
        self.check_state(Phase::Start, ComponentState::Created)?;
        match self.start_inner(completion) {
            Ok(()) => {
                self.state = ComponentState::Started;
                log::info!("started {} from {}", self.name, self.loader.describe());
                Ok(())
            }
            Err(err) => {
                self.state = ComponentState::Failed;
                self.release_root();
                Err(err)
            }
        }
    }

    fn stop(&mut self, completion: Completion) -> Result<()> {
        self.check_state(Phase::Stop, ComponentState::Started)?;
        let result = match self.exports.as_ref() {
            Some(exports) => self.run_phase(exports, Phase::Stop, completion),
            None => {
                completion.complete();
                Ok(())
            }
        };
        self.exports = None;
        self.release_root();
        self.state = match result {
            Ok(()) => ComponentState::Stopped,
            Err(_) => ComponentState::Failed,
        };
        if result.is_ok() {
            log::info!("stopped {}", self.name);
        }
        result
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Embedded
    }
}

impl Drop for EmbeddedComponent {
    fn drop(&mut self) {
        self.exports = None;
        if self.root.is_some() {
            log::debug!("{} dropped while {}", self.name, self.state.label());
        }
        self.release_root();
    }
}

impl fmt::Debug for EmbeddedComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedComponent")
            .field("name", &self.name)
            .field("loader", &self.loader)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::completion;
    use crate::engine::EngineOptions;
    use crate::host::TimerQueue;
    use crate::resources::{BundledResources, MemoryLoader};

    fn component(source: &str) -> (EmbeddedComponent, ScriptEngine) {
        let engine = ScriptEngine::bootstrap(
            Arc::new(TimerQueue::new().unwrap()),
            Arc::new(BundledResources),
            EngineOptions::default(),
        )
        .unwrap();
        let loader = Arc::new(MemoryLoader::new().with_file("app.js", source));
        (EmbeddedComponent::new(engine.clone(), "app.js", loader), engine)
    }

    #[test]
    fn hook_names_and_priority() {
        assert_eq!(
            Phase::Start.candidates().map(LifecycleHook::export_name),
            ["vertxStart", "vertxStartAsync"]
        );
        assert_eq!(
            Phase::Stop.candidates().map(LifecycleHook::export_name),
            ["vertxStop", "vertxStopAsync"]
        );
        assert!(LifecycleHook::StopAsync.is_async());
        assert!(!LifecycleHook::Start.is_async());
    }

    #[test]
    fn sync_hook_wins_over_async() {
        let (mut app, engine) = component(
            "globalThis.calls = []; \
             exports.vertxStart = function () { calls.push('sync'); }; \
             exports.vertxStartAsync = function (f) { calls.push('async'); f.complete(); };",
        );
        assert_eq!(app.name(), "app.js");
        let (token, future) = completion();
        app.start(token).unwrap();
        assert!(future.succeeded());
        assert_eq!(engine.eval_json("calls").unwrap(), serde_json::json!(["sync"]));
        assert_eq!(engine.completion_wrappers_issued(), 0);
    }

    #[test]
    fn null_hook_counts_as_absent() {
        let (mut app, _engine) = component("exports.vertxStart = null;");
        let (token, future) = completion();
        app.start(token).unwrap();
        assert!(future.succeeded());
    }

    #[test]
    fn hook_failure_leaves_token_pending() {
        let (mut app, _engine) =
            component("exports.vertxStart = function () { throw new Error('boom'); };");
        let (token, future) = completion();
        let err = app.start(token).unwrap_err();
        assert!(matches!(err, Error::Hook { hook: "vertxStart", .. }));
        assert!(err.to_string().contains("boom"));
        assert!(!future.is_complete());
        assert_eq!(app.state(), ComponentState::Failed);
    }

    #[test]
    fn evaluation_failure_is_reported() {
        let (mut app, _engine) = component("throw new Error('bad module');");
        let (token, future) = completion();
        let err = app.start(token).unwrap_err();
        assert!(matches!(err, Error::Evaluation { .. }));
        assert!(!future.is_complete());
    }

    #[test]
    fn async_stop_receives_wrapper() {
        let (mut app, engine) = component(
            "var pending; exports.vertxStopAsync = function (f) { pending = f; }; \
             exports.finish = function () { pending.fail(new Error('late')); };",
        );
        let (token, _) = completion();
        app.start(token).unwrap();

        let (token, future) = completion();
        app.stop(token).unwrap();
        assert!(!future.is_complete());
        assert_eq!(engine.completion_wrappers_issued(), 1);
        assert_eq!(app.state(), ComponentState::Stopped);
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        let (mut app, _engine) = component("");
        let (token, future) = completion();
        assert!(matches!(
            app.stop(token),
            Err(Error::InvalidState { operation: "stop", state: "created", .. })
        ));
        assert!(!future.is_complete());

        let (token, _) = completion();
        app.start(token).unwrap();
        let (token, _) = completion();
        assert!(matches!(
            app.start(token),
            Err(Error::InvalidState { operation: "start", state: "started", .. })
        ));
    }

    #[test]
    fn loader_is_a_module_root_only_while_started() {
        let (mut app, engine) = component("exports.x = 1;");
        assert!(engine.eval_json("require.resolve('app.js')").is_err());
        let (token, _) = completion();
        app.start(token).unwrap();
        assert_eq!(
            engine.eval_json("require.resolve('app.js')").unwrap(),
            serde_json::json!("app.js")
        );
        let (token, _) = completion();
        app.stop(token).unwrap();
        assert!(engine.eval_json("require.resolve('app.js')").is_err());
    }

    #[test]
    fn dropping_a_started_component_releases_its_root() {
        let (mut app, engine) = component("exports.x = 1;");
        let (token, _) = completion();
        app.start(token).unwrap();
        assert_eq!(engine.module_roots(), 1);
        drop(app);
        assert_eq!(engine.module_roots(), 0);
        assert!(engine.eval_json("require.resolve('app.js')").is_err());
    }

    #[test]
    fn failed_start_releases_its_root() {
        let (mut app, engine) = component("throw new Error('bad module');");
        let (token, _) = completion();
        assert!(app.start(token).is_err());
        assert_eq!(engine.module_roots(), 0);
    }
}
