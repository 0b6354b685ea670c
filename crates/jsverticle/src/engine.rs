//! The embedded QuickJS engine and its one-time bootstrap.
//!
//! Bootstrap turns a bare QuickJS context into something that looks like the
//! environment component scripts are written for:
//!
//! 1. create the runtime and a full context;
//! 2. read the module loader script from the system resources;
//! 3. evaluate it, tagged with its resolved path, which defines `require`;
//! 4. load the completion wrapper type (`vertx-js/future`);
//! 5. expose the host handle as `__vertx`;
//! 6. define the global bindings: `vertx`, `console`, the timer functions,
//!    `global`/`parent`, and unless disabled `process.env`.
//!
//! Any failure aborts the whole bootstrap; there is no partially prepared
//! engine.
//!
//! QuickJS is built with the `parallel` feature, so every entry into the
//! context takes the runtime lock. Values kept across entries are
//! [`Persistent`] handles, and those are only cloned or dropped under that
//! lock.

use crate::completion::{Completion, CompletionState};
use crate::component::{HookPresence, LifecycleHook};
use crate::config::BridgeSettings;
use crate::error::{Error, Result};
use crate::host::{HostSystem, TimerHandler, TimerId};
use crate::resources::{MODULE_LOADER, ResourceLoader};
use rquickjs::function::{Opt, This};
use rquickjs::{
    CaughtError, Context, Ctx, Exception, Function, Object, Persistent, Runtime, Value,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

/// Global under which the host system handle is exposed.
pub const HOST_HANDLE_GLOBAL: &str = "__vertx";

/// Log target for script `console` output.
pub const CONSOLE_TARGET: &str = "jsverticle::console";

const RESOURCE_READER_GLOBAL: &str = "__vertxResources";
const FUTURE_MODULE: &str = "vertx-js/future";

/// Root id of the system resources; component roots count up from 1.
const SYSTEM_ROOT: u64 = 0;

/// Drops cached modules whose key belongs to one module root.
const PURGE_ROOT: &str = "(function (prefix) { \
    Object.keys(require.cache).forEach(function (key) { \
      if (key.indexOf(prefix) === 0) { delete require.cache[key]; } \
    }); })";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn describe_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    CaughtError::from_error(ctx, err).to_string()
}

/// Supplies the variables captured for `process.env`.
pub type EnvironmentSource = Arc<dyn Fn() -> Vec<(String, String)> + Send + Sync>;

fn process_environment() -> Vec<(String, String)> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

/// Runtime knobs for one engine instance.
#[derive(Clone)]
pub struct EngineOptions {
    /// Define `process.env` at bootstrap.
    pub process_env: bool,
    /// Where the environment snapshot comes from; the process environment
    /// when unset.
    pub environment: Option<EnvironmentSource>,
    /// QuickJS heap limit in bytes.
    pub memory_limit: Option<usize>,
    /// QuickJS stack limit in bytes.
    pub max_stack_size: Option<usize>,
    /// When this flag becomes true, running script code is interrupted.
    pub interrupt: Option<Arc<AtomicBool>>,
}

impl EngineOptions {
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self {
            process_env: settings.process_env_shim,
            environment: None,
            memory_limit: None,
            max_stack_size: None,
            interrupt: None,
        }
    }
}

impl fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOptions")
            .field("process_env", &self.process_env)
            .field("environment", &self.environment.as_ref().map(|_| "custom"))
            .field("memory_limit", &self.memory_limit)
            .field("max_stack_size", &self.max_stack_size)
            .field("interrupt", &self.interrupt.is_some())
            .finish()
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_settings(&BridgeSettings::default())
    }
}

/// A component loader made visible to `require` by
/// [`ScriptEngine::add_module_root`].
///
/// Modules loaded from a root resolve their own relative and `node_modules`
/// requires against that root only, and are cached per root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModuleRoot(u64);

impl ModuleRoot {
    pub fn id(self) -> u64 {
        self.0
    }
}

struct TimerEntry {
    callback: Persistent<Function<'static>>,
    periodic: bool,
}

/// State shared between the engine and the native functions it exposes.
struct Bindings {
    host: Arc<dyn HostSystem>,
    system: Arc<dyn ResourceLoader>,
    roots: RwLock<Vec<(ModuleRoot, Arc<dyn ResourceLoader>)>>,
    next_root: AtomicU64,
    environment: Vec<(String, String)>,
    timers: Mutex<HashMap<TimerId, TimerEntry>>,
    engine: OnceLock<Weak<EngineInner>>,
    wrappers_issued: AtomicU64,
}

impl Bindings {
    fn new(
        host: Arc<dyn HostSystem>,
        system: Arc<dyn ResourceLoader>,
        environment: Vec<(String, String)>,
    ) -> Self {
        Self {
            host,
            system,
            roots: RwLock::new(Vec::new()),
            next_root: AtomicU64::new(SYSTEM_ROOT + 1),
            environment,
            timers: Mutex::new(HashMap::new()),
            engine: OnceLock::new(),
            wrappers_issued: AtomicU64::new(0),
        }
    }

    /// Read `name` from the `scope` root, then the system loader. Without a
    /// scope every component root is searched, most recently added first.
    /// Returns the id of the root that had it.
    fn read_resource(&self, name: &str, scope: Option<u64>) -> Result<Option<(u64, String)>> {
        let roots = self.roots.read().unwrap_or_else(PoisonError::into_inner);
        let candidates = roots
            .iter()
            .rev()
            .filter(|(root, _)| scope.is_none_or(|scope| scope == root.0))
            .map(|(root, loader)| (root.0, loader))
            .chain(std::iter::once((SYSTEM_ROOT, &self.system)));
        for (root, loader) in candidates {
            if let Some(bytes) = loader.read(name)? {
                let source = String::from_utf8(bytes).map_err(|err| {
                    Error::resource(
                        name,
                        std::io::Error::new(std::io::ErrorKind::InvalidData, err),
                    )
                })?;
                return Ok(Some((root, source)));
            }
        }
        Ok(None)
    }

    fn register_timer<'js>(
        self: &Arc<Self>,
        ctx: &Ctx<'js>,
        delay: f64,
        callback: Function<'js>,
        periodic: bool,
    ) -> TimerId {
        let delay = if delay.is_finite() && delay > 0.0 {
            Duration::from_millis(delay as u64)
        } else {
            Duration::ZERO
        };
        let weak = Arc::downgrade(self);
        let handler: TimerHandler = Box::new(move |id| {
            let engine = weak
                .upgrade()
                .and_then(|bindings| bindings.engine.get().and_then(Weak::upgrade));
            if let Some(engine) = engine {
                engine.fire_timer(id);
            }
        });
        // The host cannot fire before the entry exists: firing needs the
        // runtime lock, which the calling script holds.
        let id = if periodic {
            self.host.set_periodic(delay, handler)
        } else {
            self.host.set_timer(delay, handler)
        };
        lock(&self.timers).insert(
            id,
            TimerEntry {
                callback: Persistent::save(ctx, callback),
                periodic,
            },
        );
        id
    }

    fn cancel_timer(&self, id: TimerId) -> bool {
        let removed = lock(&self.timers).remove(&id).is_some();
        self.host.cancel_timer(id) || removed
    }
}

fn console_log(level: &str, message: &str) {
    let level = match level {
        "error" => log::Level::Error,
        "warn" => log::Level::Warn,
        "debug" => log::Level::Debug,
        "trace" => log::Level::Trace,
        _ => log::Level::Info,
    };
    log::log!(target: CONSOLE_TARGET, level, "{message}");
}

fn install_resource_reader<'js>(ctx: &Ctx<'js>, bindings: &Arc<Bindings>) -> rquickjs::Result<()> {
    let reader = Object::new(ctx.clone())?;
    let source = Arc::clone(bindings);
    reader.set(
        "readResource",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: String, scope: Option<f64>| -> rquickjs::Result<Option<Object<'js>>> {
                let found = source
                    .read_resource(&name, scope.map(|root| root as u64))
                    .map_err(|err| Exception::throw_message(&ctx, &err.to_string()))?;
                let Some((root, text)) = found else {
                    return Ok(None);
                };
                let resource = Object::new(ctx.clone())?;
                resource.set("root", root as f64)?;
                resource.set("source", text)?;
                Ok(Some(resource))
            },
        )?,
    )?;
    ctx.globals().set(RESOURCE_READER_GLOBAL, reader)
}

fn install_host_handle<'js>(ctx: &Ctx<'js>, bindings: &Arc<Bindings>) -> rquickjs::Result<()> {
    let handle = Object::new(ctx.clone())?;

    let timers = Arc::clone(bindings);
    handle.set(
        "setTimer",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, delay: f64, callback: Function<'js>| {
                timers.register_timer(&ctx, delay, callback, false) as f64
            },
        )?,
    )?;

    let timers = Arc::clone(bindings);
    handle.set(
        "setPeriodic",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, delay: f64, callback: Function<'js>| {
                timers.register_timer(&ctx, delay, callback, true) as f64
            },
        )?,
    )?;

    let timers = Arc::clone(bindings);
    handle.set(
        "cancelTimer",
        Function::new(ctx.clone(), move |id: f64| timers.cancel_timer(id as TimerId))?,
    )?;

    handle.set(
        "log",
        Function::new(ctx.clone(), |level: String, message: String| {
            console_log(&level, &message);
        })?,
    )?;

    let snapshot = Arc::clone(bindings);
    handle.set(
        "environment",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<Object<'js>> {
            let env = Object::new(ctx)?;
            for (key, value) in &snapshot.environment {
                env.set(key.as_str(), value.as_str())?;
            }
            Ok(env)
        })?,
    )?;

    ctx.globals().set(HOST_HANDLE_GLOBAL, handle)
}

fn global_bindings(process_env: bool) -> String {
    let mut globals = String::from(
        "var Vertx = require('vertx-js/vertx'); var vertx = new Vertx(__vertx);\n\
         var console = require('vertx-js/util/console');\n\
         var setTimeout = function (callback, delay) {\n\
           var args = Array.prototype.slice.call(arguments, 2);\n\
           return vertx.setTimer(delay, function () { callback.apply(null, args); });\n\
         };\n\
         var clearTimeout = function (id) { vertx.cancelTimer(id); };\n\
         var setInterval = function (callback, delay) {\n\
           var args = Array.prototype.slice.call(arguments, 2);\n\
           return vertx.setPeriodic(delay, function () { callback.apply(null, args); });\n\
         };\n\
         var clearInterval = clearTimeout;\n\
         var parent = this;\n\
         var global = this;\n",
    );
    if process_env {
        globals.push_str("var process = {}; process.env = __vertx.environment();\n");
    }
    globals
}

fn evaluate_step<R, F>(context: &Context, step: &'static str, f: F) -> Result<R>
where
    R: Send,
    F: for<'js> FnOnce(&Ctx<'js>) -> rquickjs::Result<R> + Send,
{
    context.with(|ctx| {
        f(&ctx).map_err(|err| Error::Bootstrap {
            step,
            message: describe_error(&ctx, err),
        })
    })
}

struct EngineInner {
    future_wrap: Mutex<Option<Persistent<Function<'static>>>>,
    bindings: Arc<Bindings>,
    context: Context,
    runtime: Runtime,
}

impl EngineInner {
    fn run<R, F>(&self, f: F) -> std::result::Result<R, String>
    where
        R: Send,
        F: for<'js> FnOnce(&Ctx<'js>) -> rquickjs::Result<R> + Send,
    {
        let result = self
            .context
            .with(|ctx| f(&ctx).map_err(|err| describe_error(&ctx, err)));
        self.drain_jobs();
        result
    }

    fn drain_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => log::warn!("uncaught exception in a pending promise job"),
            }
        }
    }

    fn fire_timer(&self, id: TimerId) {
        let result = self.run(|ctx| {
            let callback = {
                let mut timers = lock(&self.bindings.timers);
                let periodic = match timers.get(&id) {
                    Some(entry) => entry.periodic,
                    None => return Ok(()),
                };
                let callback = if periodic {
                    timers.get(&id).map(|entry| entry.callback.clone())
                } else {
                    timers.remove(&id).map(|entry| entry.callback)
                };
                match callback {
                    Some(callback) => callback,
                    None => return Ok(()),
                }
            };
            let callback = callback.restore(ctx)?;
            let _: Value = callback.call(())?;
            Ok(())
        });
        if let Err(message) = result {
            log::warn!("timer {id} callback failed: {message}");
        }
    }

    fn completion_wrapper<'js>(
        &self,
        ctx: &Ctx<'js>,
        state: Arc<CompletionState>,
    ) -> rquickjs::Result<Value<'js>> {
        let native = Object::new(ctx.clone())?;

        let token = Arc::clone(&state);
        native.set(
            "complete",
            Function::new(ctx.clone(), move || {
                if !token.resolve(Ok(())) {
                    log::warn!("lifecycle completion already resolved; ignoring complete()");
                }
            })?,
        )?;

        let token = Arc::clone(&state);
        native.set(
            "fail",
            Function::new(ctx.clone(), move |cause: Opt<String>| {
                let cause = cause.0.unwrap_or_else(|| "failed".to_string());
                if !token.resolve(Err(cause)) {
                    log::warn!("lifecycle completion already resolved; ignoring fail()");
                }
            })?,
        )?;

        native.set(
            "isComplete",
            Function::new(ctx.clone(), move || state.is_resolved())?,
        )?;

        let wrap = lock(&self.future_wrap).clone();
        let Some(wrap) = wrap else {
            return Err(Exception::throw_message(
                ctx,
                "completion wrapper type is not loaded",
            ));
        };
        let wrap = wrap.restore(ctx)?;
        self.bindings.wrappers_issued.fetch_add(1, Ordering::Relaxed);
        wrap.call((native,))
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let bindings = &self.bindings;
        let future_wrap = &self.future_wrap;
        self.context.with(|_ctx| {
            let timers: Vec<TimerId> = lock(&bindings.timers).drain().map(|(id, _)| id).collect();
            for id in timers {
                bindings.host.cancel_timer(id);
            }
            lock(future_wrap).take();
        });
    }
}

/// A component's exported surface, kept alive between `start` and `stop`.
pub struct Exports {
    name: String,
    surface: Option<Persistent<Object<'static>>>,
    engine: Arc<EngineInner>,
}

impl Exports {
    /// The component name the surface was loaded for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the module exported an object at all.
    pub fn is_object(&self) -> bool {
        self.surface.is_some()
    }
}

impl Drop for Exports {
    fn drop(&mut self) {
        if let Some(surface) = self.surface.take() {
            self.engine.context.with(|_ctx| drop(surface));
        }
    }
}

/// Handle to a bootstrapped engine. Cheap to clone.
#[derive(Clone)]
pub struct ScriptEngine {
    inner: Arc<EngineInner>,
}

impl ScriptEngine {
    /// Create and bootstrap an engine.
    ///
    /// `system` supplies the module loader and the other bundled scripts;
    /// component loaders are added later with [`ScriptEngine::add_module_root`].
    pub fn bootstrap(
        host: Arc<dyn HostSystem>,
        system: Arc<dyn ResourceLoader>,
        options: EngineOptions,
    ) -> Result<Self> {
        let runtime = Runtime::new().map_err(|err| Error::EngineUnavailable(err.to_string()))?;
        if let Some(limit) = options.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = options.max_stack_size {
            runtime.set_max_stack_size(limit);
        }
        if let Some(halt) = options.interrupt.clone() {
            runtime.set_interrupt_handler(Some(Box::new(move || halt.load(Ordering::Relaxed))));
        }
        let context =
            Context::full(&runtime).map_err(|err| Error::EngineUnavailable(err.to_string()))?;

        let loader_source = system
            .read(MODULE_LOADER)?
            .ok_or_else(|| Error::MissingBootstrapResource(MODULE_LOADER.to_string()))?;
        let loader_source = String::from_utf8(loader_source).map_err(|_| Error::Bootstrap {
            step: "module loader",
            message: "source is not valid UTF-8".to_string(),
        })?;
        let loader_script = format!(
            "{loader_source}\n//# sourceURL={}",
            system.resolve_path(MODULE_LOADER)
        );

        let environment = match &options.environment {
            Some(source) => source(),
            None => process_environment(),
        };
        let bindings = Arc::new(Bindings::new(host, system, environment));

        evaluate_step(&context, "module loader", |ctx| {
            install_resource_reader(ctx, &bindings)?;
            ctx.eval::<Value, _>(loader_script).map(drop)
        })?;

        let future_wrap = evaluate_step(&context, "completion wrapper", |ctx| {
            let wrap: Function = ctx.eval(format!("require('{FUTURE_MODULE}').wrap"))?;
            Ok(Persistent::save(ctx, wrap))
        })?;

        evaluate_step(&context, "host handle", |ctx| install_host_handle(ctx, &bindings))?;

        let globals = global_bindings(options.process_env);
        evaluate_step(&context, "global bindings", |ctx| {
            ctx.eval::<Value, _>(globals).map(drop)
        })?;

        let inner = Arc::new(EngineInner {
            future_wrap: Mutex::new(Some(future_wrap)),
            bindings: Arc::clone(&bindings),
            context,
            runtime,
        });
        let _ = bindings.engine.set(Arc::downgrade(&inner));

        log::debug!(
            "script engine ready (process.env shim {})",
            if options.process_env { "on" } else { "off" }
        );
        Ok(Self { inner })
    }

    /// Make a loader's resources visible to `require`.
    ///
    /// Unscoped lookups, such as a top-level `require`, try the newest root
    /// first and the system resources last.
    pub fn add_module_root(&self, loader: Arc<dyn ResourceLoader>) -> ModuleRoot {
        let root = ModuleRoot(self.inner.bindings.next_root.fetch_add(1, Ordering::SeqCst));
        self.inner
            .bindings
            .roots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((root, loader));
        root
    }

    /// Remove a root added with [`ScriptEngine::add_module_root`] and drop
    /// the modules cached from it.
    pub fn remove_module_root(&self, root: ModuleRoot) {
        self.inner
            .bindings
            .roots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _)| *id != root);
        let prefix = format!("{}:", root.0);
        let purged = self.inner.run(|ctx| {
            let purge: Function = ctx.eval(PURGE_ROOT)?;
            let _: Value = purge.call((prefix.as_str(),))?;
            Ok(())
        });
        if let Err(message) = purged {
            log::warn!("failed to drop cached modules of root {}: {message}", root.0);
        }
    }

    /// Number of component roots currently visible to `require`.
    pub fn module_roots(&self) -> usize {
        self.inner
            .bindings
            .roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Evaluate the module `name` of `root` afresh, bypassing the module
    /// cache.
    ///
    /// With `strict`, the module body runs in strict mode and cannot create
    /// globals by assignment.
    pub fn require_fresh(&self, root: ModuleRoot, name: &str, strict: bool) -> Result<Exports> {
        let surface = self
            .inner
            .run(|ctx| {
                let no_cache: Function = ctx.eval("require.noCache")?;
                let exports: Value = no_cache.call((name, root.0 as f64, strict))?;
                Ok(exports.into_object().map(|object| Persistent::save(ctx, object)))
            })
            .map_err(|message| Error::Evaluation {
                name: name.to_string(),
                message,
            })?;
        Ok(Exports {
            name: name.to_string(),
            surface,
            engine: Arc::clone(&self.inner),
        })
    }

    /// Whether `exports` carries a usable member for `hook`.
    ///
    /// A member is present unless it is missing, `undefined` or `null`.
    pub fn probe(&self, exports: &Exports, hook: LifecycleHook) -> Result<HookPresence> {
        let Some(surface) = exports.surface.as_ref() else {
            return Ok(HookPresence::Absent);
        };
        self.inner
            .run(|ctx| {
                let object = surface.clone().restore(ctx)?;
                let member: Value = object.get(hook.export_name())?;
                Ok(if member.is_undefined() || member.is_null() {
                    HookPresence::Absent
                } else {
                    HookPresence::Present
                })
            })
            .map_err(|message| hook_error(exports, hook, message))
    }

    /// Call a synchronous hook with no arguments.
    pub fn invoke(&self, exports: &Exports, hook: LifecycleHook) -> Result<()> {
        self.call_hook(exports, hook, None)
    }

    /// Call an asynchronous hook, passing a script-visible wrapper of
    /// `completion` as its only argument. The hook resolves it.
    pub fn invoke_with_completion(
        &self,
        exports: &Exports,
        hook: LifecycleHook,
        completion: Completion,
    ) -> Result<()> {
        self.call_hook(exports, hook, Some(completion.into_state()))
    }

    fn call_hook(
        &self,
        exports: &Exports,
        hook: LifecycleHook,
        completion: Option<Arc<CompletionState>>,
    ) -> Result<()> {
        let Some(surface) = exports.surface.as_ref() else {
            return Err(hook_error(exports, hook, "exports are not an object".into()));
        };
        let inner = &self.inner;
        inner
            .run(|ctx| {
                let object = surface.clone().restore(ctx)?;
                let function: Function = object.get(hook.export_name())?;
                let _: Value = match completion {
                    None => function.call((This(object),))?,
                    Some(state) => {
                        let wrapper = inner.completion_wrapper(ctx, state)?;
                        function.call((This(object), wrapper))?
                    }
                };
                Ok(())
            })
            .map_err(|message| hook_error(exports, hook, message))
    }

    /// Evaluate `source` as a global script and return its value as JSON.
    ///
    /// Values with no JSON form (functions, `undefined`) come back as `null`.
    pub fn eval_json(&self, source: &str) -> Result<serde_json::Value> {
        let text = self
            .inner
            .run(|ctx| {
                let value: Value = ctx.eval(source)?;
                match ctx.json_stringify(value)? {
                    Some(text) => text.to_string().map(Some),
                    None => Ok(None),
                }
            })
            .map_err(|message| Error::Evaluation {
                name: "<eval>".to_string(),
                message,
            })?;
        match text {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Ok(serde_json::Value::Null),
        }
    }

    /// How many completion wrappers have been handed to asynchronous hooks.
    pub fn completion_wrappers_issued(&self) -> u64 {
        self.inner.bindings.wrappers_issued.load(Ordering::Relaxed)
    }

    /// Number of script timers currently registered.
    pub fn active_timers(&self) -> usize {
        lock(&self.inner.bindings.timers).len()
    }

    /// Run `f` inside the engine context.
    pub(crate) fn run<R, F>(&self, f: F) -> std::result::Result<R, String>
    where
        R: Send,
        F: for<'js> FnOnce(&Ctx<'js>) -> rquickjs::Result<R> + Send,
    {
        self.inner.run(f)
    }
}

fn hook_error(exports: &Exports, hook: LifecycleHook, message: String) -> Error {
    Error::Hook {
        name: exports.name.clone(),
        hook: hook.export_name(),
        message,
    }
}
