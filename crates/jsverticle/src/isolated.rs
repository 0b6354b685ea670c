//! Package-style components run in the isolated runtime.

use crate::completion::Completion;
use crate::component::{Component, ComponentKind};
use crate::error::Result;
use crate::resources::normalize_name;
use crate::sandbox::{SandboxEnvironment, SandboxScript, ScriptFuture, ScriptOptions, ScriptStatus};
use std::path::Path;
use std::time::Duration;

/// A component executing as its own [`SandboxScript`].
///
/// `start` completes as soon as the script is launched. How the script ends
/// is logged and available from [`IsolatedComponent::script_status`], but
/// never reported through a completion token.
pub struct IsolatedComponent {
    script: SandboxScript,
    status: Option<ScriptFuture>,
}

impl IsolatedComponent {
    /// Bind `name`, resolved inside the materialized package `root`, to a new
    /// script unit.
    pub fn new(
        environment: &SandboxEnvironment,
        name: &str,
        root: &Path,
        options: Option<ScriptOptions>,
    ) -> Result<Self> {
        let normalized = normalize_name(name)?;
        let file = root.join(&normalized);
        log::info!("Resolving {}", file.display());
        let script = environment.create_script(name, &file, options)?;
        Ok(Self {
            script,
            status: None,
        })
    }

    pub fn name(&self) -> &str {
        self.script.name()
    }

    /// The script's terminal status, once it has finished.
    pub fn script_status(&self) -> Option<ScriptStatus> {
        self.status.as_ref().and_then(ScriptFuture::status)
    }

    /// Wait up to `timeout` for the launched script to finish.
    pub fn wait_for_exit(&self, timeout: Duration) -> Option<ScriptStatus> {
        self.status
            .as_ref()
            .and_then(|status| status.wait_timeout(timeout))
    }
}

impl Component for IsolatedComponent {
    fn start(&mut self, completion: Completion) -> Result<()> {
        log::info!("Starting isolated component {}", self.name());
        let status = self.script.execute()?;
        let name = self.name().to_string();
        status.set_listener(move |status| {
            log::info!("Execution status for {name}: {}", status.exit_code());
            if let Some(cause) = status.cause() {
                log::info!("Cause: {cause}");
            }
        });
        self.status = Some(status);
        completion.complete();
        Ok(())
    }

    fn stop(&mut self, completion: Completion) -> Result<()> {
        self.script.close();
        completion.complete();
        Ok(())
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Isolated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::completion;

    #[test]
    fn start_completes_before_script_outcome() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("server.js"), "throw new Error('crash');").unwrap();
        let mut component =
            IsolatedComponent::new(&SandboxEnvironment::new(), "server.js", dir.path(), None)
                .unwrap();
        assert_eq!(component.kind(), ComponentKind::Isolated);
        assert_eq!(component.name(), "server.js");

        let (token, future) = completion();
        component.start(token).unwrap();
        assert!(future.succeeded());

        let status = component.wait_for_exit(Duration::from_secs(10)).unwrap();
        assert_eq!(status.exit_code(), ScriptStatus::EXCEPTION);
        assert_eq!(component.script_status(), Some(status));
    }

    #[test]
    fn stop_closes_the_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("loop.js"), "setInterval(function () {}, 5);").unwrap();
        let mut component =
            IsolatedComponent::new(&SandboxEnvironment::new(), "./loop.js", dir.path(), None)
                .unwrap();
        let (token, _) = completion();
        component.start(token).unwrap();

        let (token, future) = completion();
        component.stop(token).unwrap();
        assert!(future.succeeded());
        assert_eq!(
            component.script_status().map(|s| s.exit_code()),
            Some(ScriptStatus::CANCELLED)
        );
    }

    #[test]
    fn missing_entry_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            IsolatedComponent::new(&SandboxEnvironment::new(), "absent.js", dir.path(), None)
                .is_err()
        );
    }
}
