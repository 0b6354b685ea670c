//! Isolated script runtime for package-style components.
//!
//! Each [`SandboxScript`] runs on its own thread, in its own QuickJS runtime
//! with memory and stack limits, with a private [`TimerQueue`] as its event
//! loop. The package directory is the module root, so `require` sees the
//! package's own files and `node_modules`. The script ends when its event
//! loop runs dry, when it calls `process.exit`, or when it is closed.

use crate::engine::{EngineOptions, ScriptEngine};
use crate::error::{Error, Result};
use crate::host::{HostSystem, TimerQueue, block_on_timeout};
use crate::package::MANIFEST;
use crate::resources::{BundledResources, DirectoryLoader};
use rquickjs::function::Opt;
use rquickjs::{Ctx, Exception, Function, Object, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;

const COMPAT_MODULE: &str = "vertx-js/node/compat";

/// Stack reserved for sandbox threads; comfortably above the default script
/// stack limit.
const THREAD_STACK_BYTES: usize = 8 * 1024 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runtime resource limits for one sandboxed script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Maximum script heap in bytes (default: 64 MiB).
    pub max_memory_bytes: usize,
    /// Maximum script stack in bytes (default: 1 MiB).
    pub max_stack_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024,
            max_stack_bytes: 1024 * 1024,
        }
    }
}

/// Per-script options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptOptions {
    /// Arguments after the script, exposed as `process.argv[1..]`.
    pub argv: Vec<String>,
    /// Populate `process.env` from the host environment.
    pub process_env: bool,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            argv: Vec::new(),
            process_env: true,
        }
    }
}

/// Terminal status of a sandboxed script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptStatus {
    exit_code: i32,
    cause: Option<String>,
}

impl ScriptStatus {
    pub const OK: i32 = 0;
    /// The script threw and nothing caught it.
    pub const EXCEPTION: i32 = -1;
    /// The script was closed before it finished.
    pub const CANCELLED: i32 = -2;

    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            cause: None,
        }
    }

    pub fn exception(cause: impl Into<String>) -> Self {
        Self {
            exit_code: Self::EXCEPTION,
            cause: Some(cause.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self::exited(Self::CANCELLED)
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn has_cause(&self) -> bool {
        self.cause.is_some()
    }

    pub fn is_ok(&self) -> bool {
        self.exit_code == Self::OK
    }
}

type StatusListener = Box<dyn FnOnce(&ScriptStatus) + Send + 'static>;

struct FutureInner {
    status: watch::Sender<Option<ScriptStatus>>,
    /// Also serializes resolution against listener registration.
    listener: Mutex<Option<StatusListener>>,
}

impl Default for FutureInner {
    fn default() -> Self {
        Self {
            status: watch::Sender::new(None),
            listener: Mutex::new(None),
        }
    }
}

/// Handle to a running script's eventual [`ScriptStatus`].
#[derive(Clone, Default)]
pub struct ScriptFuture {
    inner: Arc<FutureInner>,
}

impl ScriptFuture {
    fn resolve(&self, status: ScriptStatus) {
        let listener = {
            let mut listener = lock(&self.inner.listener);
            let first = self.inner.status.send_if_modified(|slot| {
                if slot.is_some() {
                    return false;
                }
                *slot = Some(status.clone());
                true
            });
            if !first {
                return;
            }
            listener.take()
        };
        if let Some(listener) = listener {
            listener(&status);
        }
    }

    /// Register the completion listener.
    ///
    /// It runs exactly once: right away on this thread if the script already
    /// finished, otherwise on the script thread when it does. A later call
    /// replaces a listener that has not run yet.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: FnOnce(&ScriptStatus) + Send + 'static,
    {
        let finished = {
            let mut slot = lock(&self.inner.listener);
            let status = self.inner.status.borrow().clone();
            if status.is_none() {
                *slot = Some(Box::new(listener));
                return;
            }
            status
        };
        if let Some(status) = finished {
            listener(&status);
        }
    }

    pub fn status(&self) -> Option<ScriptStatus> {
        self.inner.status.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.inner.status.borrow().is_some()
    }

    /// Wait up to `timeout` for the script to finish.
    ///
    /// Drives a private runtime; must not be called from a timer handler.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ScriptStatus> {
        let mut status = self.inner.status.subscribe();
        block_on_timeout(timeout, async move {
            let done = status.wait_for(Option::is_some).await;
            done.ok().and_then(|slot| slot.clone())
        })
        .flatten()
    }
}

/// Shared between a script's thread and its owner.
#[derive(Default)]
struct ScriptControl {
    /// Checked by the runtime's interrupt handler.
    halt: Arc<AtomicBool>,
    closed: AtomicBool,
    exit_code: Mutex<Option<i32>>,
}

impl ScriptControl {
    fn request_exit(&self, code: i32) {
        lock(&self.exit_code).get_or_insert(code);
        self.halt.store(true, Ordering::SeqCst);
    }

    fn final_status(&self, error: Option<String>) -> ScriptStatus {
        if let Some(code) = *lock(&self.exit_code) {
            return ScriptStatus::exited(code);
        }
        if self.closed.load(Ordering::SeqCst) {
            return ScriptStatus::cancelled();
        }
        match error {
            Some(cause) => ScriptStatus::exception(cause),
            None => ScriptStatus::exited(ScriptStatus::OK),
        }
    }
}

/// Factory for sandboxed scripts sharing one set of limits.
#[derive(Clone, Debug, Default)]
pub struct SandboxEnvironment {
    limits: SandboxLimits,
}

impl SandboxEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    /// Create a script unit for `file`. The file is read when the script
    /// executes, not here.
    ///
    /// The module root is the nearest ancestor directory holding a
    /// `package.json`, or the file's own directory.
    pub fn create_script(
        &self,
        name: &str,
        file: &Path,
        options: Option<ScriptOptions>,
    ) -> Result<SandboxScript> {
        if !file.is_file() {
            return Err(Error::Sandbox(format!(
                "script {} for {name} does not exist",
                file.display()
            )));
        }
        let parent = file.parent().unwrap_or_else(|| Path::new("."));
        let root = parent
            .ancestors()
            .find(|dir| dir.join(MANIFEST).is_file())
            .unwrap_or(parent)
            .to_path_buf();
        let main = file
            .strip_prefix(&root)
            .map_err(|_| Error::Sandbox(format!("{} is outside {}", file.display(), root.display())))?
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        Ok(SandboxScript {
            name: name.to_string(),
            root,
            main,
            limits: self.limits,
            options: options.unwrap_or_default(),
            control: Arc::new(ScriptControl::default()),
            queue: Arc::new(TimerQueue::new()?),
            thread: None,
            future: None,
        })
    }
}

/// One sandboxed script execution.
pub struct SandboxScript {
    name: String,
    root: PathBuf,
    main: String,
    limits: SandboxLimits,
    options: ScriptOptions,
    control: Arc<ScriptControl>,
    queue: Arc<TimerQueue>,
    thread: Option<JoinHandle<()>>,
    future: Option<ScriptFuture>,
}

impl SandboxScript {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The module root the script resolves `require` against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start the script on its own thread.
    ///
    /// A script executes at most once; later calls return the same future.
    pub fn execute(&mut self) -> Result<ScriptFuture> {
        if let Some(future) = &self.future {
            return Ok(future.clone());
        }
        let future = ScriptFuture::default();
        if self.control.closed.load(Ordering::SeqCst) {
            future.resolve(ScriptStatus::cancelled());
            self.future = Some(future.clone());
            return Ok(future);
        }

        let job = ScriptJob {
            root: self.root.clone(),
            main: self.main.clone(),
            limits: self.limits,
            options: self.options.clone(),
            control: Arc::clone(&self.control),
            queue: Arc::clone(&self.queue),
        };
        let completion = future.clone();
        let thread = std::thread::Builder::new()
            .name(format!("jsverticle-sandbox-{}", self.name))
            .stack_size(THREAD_STACK_BYTES)
            .spawn(move || completion.resolve(job.run()))?;

        self.thread = Some(thread);
        self.future = Some(future.clone());
        Ok(future)
    }

    /// Stop the script and release its runtime. Idempotent.
    pub fn close(&mut self) {
        self.control.closed.store(true, Ordering::SeqCst);
        self.control.halt.store(true, Ordering::SeqCst);
        self.queue.shutdown();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("sandbox thread for {} panicked", self.name);
                if let Some(future) = &self.future {
                    future.resolve(ScriptStatus::exception("sandbox thread panicked"));
                }
            }
        }
    }
}

impl Drop for SandboxScript {
    fn drop(&mut self) {
        self.close();
    }
}

struct ScriptJob {
    root: PathBuf,
    main: String,
    limits: SandboxLimits,
    options: ScriptOptions,
    control: Arc<ScriptControl>,
    queue: Arc<TimerQueue>,
}

impl ScriptJob {
    fn run(self) -> ScriptStatus {
        let options = EngineOptions {
            process_env: self.options.process_env,
            environment: None,
            memory_limit: Some(self.limits.max_memory_bytes),
            max_stack_size: Some(self.limits.max_stack_bytes),
            interrupt: Some(Arc::clone(&self.control.halt)),
        };
        let host: Arc<dyn HostSystem> = self.queue.clone();
        let engine = match ScriptEngine::bootstrap(host, Arc::new(BundledResources), options) {
            Ok(engine) => engine,
            Err(err) => return self.control.final_status(Some(err.to_string())),
        };
        let root = engine.add_module_root(Arc::new(DirectoryLoader::new(&self.root)));

        let cwd = self.root.display().to_string();
        let result = engine.run(|ctx| {
            install_compat(ctx, &cwd, &self.options.argv, &self.control, &self.queue)?;
            let no_cache: Function = ctx.eval("require.noCache")?;
            let _: Value = no_cache.call((self.main.as_str(), root.id() as f64, false))?;
            Ok(())
        });
        if result.is_ok() {
            self.queue.run(true);
        }
        let status = self.control.final_status(result.err());
        drop(engine);
        status
    }
}

fn install_compat<'js>(
    ctx: &Ctx<'js>,
    cwd: &str,
    argv: &[String],
    control: &Arc<ScriptControl>,
    queue: &Arc<TimerQueue>,
) -> rquickjs::Result<()> {
    let native = Object::new(ctx.clone())?;
    native.set("platform", std::env::consts::OS)?;
    native.set("cwd", cwd)?;

    let control = Arc::clone(control);
    let queue = Arc::clone(queue);
    native.set(
        "exit",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, code: Opt<i32>| -> rquickjs::Result<()> {
                let code = code.0.unwrap_or(ScriptStatus::OK);
                control.request_exit(code);
                queue.shutdown();
                Err(Exception::throw_message(&ctx, &format!("process.exit({code})")))
            },
        )?,
    )?;

    let install: Function = ctx.eval(format!("require('{COMPAT_MODULE}')"))?;
    let _: Value = install.call((ctx.globals(), native, argv.to_vec()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(10);

    fn script(dir: &Path, source: &str) -> SandboxScript {
        let file = dir.join("main.js");
        std::fs::write(&file, source).unwrap();
        SandboxEnvironment::new()
            .create_script("test", &file, None)
            .unwrap()
    }

    #[test]
    fn default_limits() {
        let limits = SandboxLimits::default();
        assert_eq!(limits.max_memory_bytes, 64 * 1024 * 1024);
        assert_eq!(limits.max_stack_bytes, 1024 * 1024);
    }

    #[test]
    fn missing_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = SandboxEnvironment::new()
            .create_script("x", &dir.path().join("nope.js"), None)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Sandbox(_)));
    }

    #[test]
    fn module_root_is_package_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST), "{}").unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/server.js"), "").unwrap();
        let script = SandboxEnvironment::new()
            .create_script("svc", &dir.path().join("lib/server.js"), None)
            .unwrap();
        assert_eq!(script.root(), dir.path());
        assert_eq!(script.main, "lib/server.js");
    }

    #[test]
    fn script_that_finishes_reports_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut script = script(dir.path(), "var x = 1 + 1;");
        let status = script.execute().unwrap().wait_timeout(WAIT).unwrap();
        assert_eq!(status, ScriptStatus::exited(ScriptStatus::OK));
    }

    #[test]
    fn timers_keep_the_script_alive() {
        let dir = tempfile::tempdir().unwrap();
        let mut script = script(
            dir.path(),
            "setTimeout(function (code) { process.exit(code); }, 20, 3);",
        );
        let status = script.execute().unwrap().wait_timeout(WAIT).unwrap();
        assert_eq!(status.exit_code(), 3);
        assert!(!status.has_cause());
    }

    #[test]
    fn uncaught_exception_reports_cause() {
        let dir = tempfile::tempdir().unwrap();
        let mut script = script(dir.path(), "throw new Error('kaboom');");
        let status = script.execute().unwrap().wait_timeout(WAIT).unwrap();
        assert_eq!(status.exit_code(), ScriptStatus::EXCEPTION);
        assert!(status.cause().unwrap().contains("kaboom"));
    }

    #[test]
    fn node_globals_are_installed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.js");
        std::fs::write(
            &file,
            "var ok = typeof process.nextTick === 'function' && typeof setImmediate === 'function' \
             && process.argv[1] === 'serve' && process.cwd().length > 0 \
             && typeof process.env === 'object'; process.exit(ok ? 0 : 9);",
        )
        .unwrap();
        let mut script = SandboxEnvironment::new()
            .create_script(
                "globals",
                &file,
                Some(ScriptOptions {
                    argv: vec!["serve".to_string()],
                    process_env: true,
                }),
            )
            .unwrap();
        let status = script.execute().unwrap().wait_timeout(WAIT).unwrap();
        assert_eq!(status.exit_code(), 0);
    }

    #[test]
    fn requires_package_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST), "{}").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/seven")).unwrap();
        std::fs::write(
            dir.path().join("node_modules/seven/index.js"),
            "module.exports = 7;",
        )
        .unwrap();
        let mut script = script(dir.path(), "process.exit(require('seven'));");
        let status = script.execute().unwrap().wait_timeout(WAIT).unwrap();
        assert_eq!(status.exit_code(), 7);
    }

    #[test]
    fn close_cancels_a_long_running_script() {
        let dir = tempfile::tempdir().unwrap();
        let mut script = script(dir.path(), "setInterval(function () {}, 5);");
        let future = script.execute().unwrap();
        let (tx, rx) = mpsc::channel();
        future.set_listener(move |status| {
            let _ = tx.send(status.exit_code());
        });
        std::thread::sleep(Duration::from_millis(30));
        assert!(!future.is_done());
        script.close();
        script.close();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ScriptStatus::CANCELLED);
    }

    #[test]
    fn close_interrupts_busy_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut script = script(dir.path(), "for (;;) {}");
        let future = script.execute().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        script.close();
        assert_eq!(
            future.wait_timeout(WAIT).map(|s| s.exit_code()),
            Some(ScriptStatus::CANCELLED)
        );
    }

    #[test]
    fn listener_set_after_completion_runs_immediately() {
        let future = ScriptFuture::default();
        future.resolve(ScriptStatus::exited(4));
        let (tx, rx) = mpsc::channel();
        future.set_listener(move |status| {
            let _ = tx.send(status.exit_code());
        });
        assert_eq!(rx.try_recv().unwrap(), 4);
        future.resolve(ScriptStatus::exited(5));
        assert_eq!(future.status(), Some(ScriptStatus::exited(4)));
    }
}
