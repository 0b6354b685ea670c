//! Write-once lifecycle completion tokens.
//!
//! The host creates a pair with [`completion`], hands the [`Completion`] to
//! `start`/`stop` and keeps the [`LifecycleFuture`] to observe the outcome.
//! Resolving consumes the `Completion`, so bridge code can resolve it at most
//! once. The script-visible wrapper shares the same state and reports a second
//! resolution attempt instead of applying it.
//!
//! There is no timeout: a hook that never resolves its token leaves the future
//! pending forever.

use crate::host::{block_on, block_on_timeout};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Outcome of a lifecycle call: success, or a failure cause.
pub type Outcome = std::result::Result<(), String>;

#[derive(Debug)]
pub(crate) struct CompletionState {
    outcome: watch::Sender<Option<Outcome>>,
}

impl CompletionState {
    fn new() -> Self {
        Self {
            outcome: watch::Sender::new(None),
        }
    }

    /// Record the outcome. Returns `false` when one was already recorded.
    pub(crate) fn resolve(&self, outcome: Outcome) -> bool {
        self.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    fn outcome(&self) -> Option<Outcome> {
        self.outcome.borrow().clone()
    }

    async fn resolved(&self) -> Option<Outcome> {
        let mut outcome = self.outcome.subscribe();
        let resolved = outcome.wait_for(Option::is_some).await;
        resolved.ok().and_then(|slot| slot.clone())
    }
}

/// Create a linked token / future pair.
pub fn completion() -> (Completion, LifecycleFuture) {
    let state = Arc::new(CompletionState::new());
    (
        Completion {
            state: Arc::clone(&state),
        },
        LifecycleFuture { state },
    )
}

/// The resolving half, handed to `Component::start` and `Component::stop`.
#[derive(Debug)]
pub struct Completion {
    state: Arc<CompletionState>,
}

impl Completion {
    /// Resolve successfully.
    pub fn complete(self) {
        self.state.resolve(Ok(()));
    }

    /// Resolve with a failure cause.
    pub fn fail(self, cause: impl Into<String>) {
        self.state.resolve(Err(cause.into()));
    }

    pub(crate) fn into_state(self) -> Arc<CompletionState> {
        self.state
    }
}

/// The observing half kept by the host.
///
/// The blocking waits drive a private runtime and must not be called from a
/// timer handler.
#[derive(Clone, Debug)]
pub struct LifecycleFuture {
    state: Arc<CompletionState>,
}

impl LifecycleFuture {
    pub fn is_complete(&self) -> bool {
        self.state.is_resolved()
    }

    /// The outcome, if the token has been resolved.
    pub fn outcome(&self) -> Option<Outcome> {
        self.state.outcome()
    }

    /// Whether the token was resolved successfully.
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome(), Some(Ok(())))
    }

    /// Block until the token is resolved.
    pub fn wait(&self) -> Outcome {
        block_on(self.state.resolved())
            .flatten()
            .unwrap_or_else(|| Err("lifecycle wait failed".to_string()))
    }

    /// Block until the token is resolved or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        block_on_timeout(timeout, self.state.resolved()).flatten()
    }
}
