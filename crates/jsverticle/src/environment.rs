//! Process-wide embedded engine.
//!
//! The engine is bootstrapped lazily by the first component creation and then
//! lives for the rest of the process. A failed bootstrap is remembered: every
//! later call reports it instead of trying again.

use crate::config::BridgeSettings;
use crate::engine::{EngineOptions, ScriptEngine};
use crate::error::{Error, Result};
use crate::host::HostSystem;
use crate::resources::BundledResources;
use std::sync::{Arc, OnceLock};

static ENGINE: OnceLock<std::result::Result<ScriptEngine, String>> = OnceLock::new();

/// Bootstrap the process-wide engine if needed and return it.
///
/// Safe under concurrent first use: exactly one caller bootstraps, the others
/// block until it finishes. `host` is only consulted by that first call.
pub fn ensure_ready(host: &Arc<dyn HostSystem>) -> Result<ScriptEngine> {
    let state = ENGINE.get_or_init(|| {
        let options = EngineOptions::from_settings(BridgeSettings::global());
        ScriptEngine::bootstrap(Arc::clone(host), Arc::new(BundledResources), options).map_err(
            |err| {
                log::error!("embedded engine bootstrap failed: {err}");
                err.to_string()
            },
        )
    });
    match state {
        Ok(engine) => Ok(engine.clone()),
        Err(message) => Err(Error::BootstrapFailed(message.clone())),
    }
}

/// Whether [`ensure_ready`] has succeeded in this process.
pub fn is_ready() -> bool {
    matches!(ENGINE.get(), Some(Ok(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ThreadedHost;

    #[test]
    fn engine_is_shared_and_bootstrapped_once() {
        let host: Arc<dyn HostSystem> = Arc::new(ThreadedHost::new().unwrap());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let host = Arc::clone(&host);
                std::thread::spawn(move || ensure_ready(&host).map(|_| ()))
            })
            .collect();
        for thread in threads {
            thread.join().unwrap().unwrap();
        }
        assert!(is_ready());

        let first = ensure_ready(&host).unwrap();
        first.eval_json("globalThis.marker = 'shared'").unwrap();
        let second = ensure_ready(&host).unwrap();
        assert_eq!(
            second.eval_json("marker").unwrap(),
            serde_json::json!("shared")
        );
    }
}
