//! Error types for the JavaScript component bridge.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the bridge's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the bridge.
///
/// The first four variants are configuration failures: the embedded engine
/// could not be prepared and no embedded component can be created in this
/// process. Everything else is scoped to a single component or resource.
#[derive(Error, Debug)]
pub enum Error {
    #[error("embedded JavaScript engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("cannot find bootstrap resource {0}")]
    MissingBootstrapResource(String),

    #[error("failed to evaluate {step} during engine bootstrap: {message}")]
    Bootstrap { step: &'static str, message: String },

    #[error("engine bootstrap failed earlier in this process: {0}")]
    BootstrapFailed(String),

    #[error("failed to evaluate component {name}: {message}")]
    Evaluation { name: String, message: String },

    #[error("{hook} of component {name} failed: {message}")]
    Hook {
        name: String,
        hook: &'static str,
        message: String,
    },

    #[error("component {name} cannot {operation} while {state}")]
    InvalidState {
        name: String,
        operation: &'static str,
        state: &'static str,
    },

    #[error("invalid resource name {0:?}")]
    InvalidName(String),

    #[error("resource {name}: {source}")]
    Resource {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("{0} cannot be materialized onto the filesystem")]
    NotMaterializable(String),

    #[error("invalid package manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("isolated runtime: {0}")]
    Sandbox(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error leaves the process without a usable embedded engine.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::EngineUnavailable(_)
                | Self::MissingBootstrapResource(_)
                | Self::Bootstrap { .. }
                | Self::BootstrapFailed(_)
        )
    }

    pub(crate) fn resource(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Resource {
            name: name.into(),
            source,
        }
    }

    pub(crate) fn archive(path: impl Into<PathBuf>, source: zip::result::ZipError) -> Self {
        Self::Archive {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_fatal() {
        assert!(Error::EngineUnavailable("no runtime".into()).is_fatal());
        assert!(Error::MissingBootstrapResource("loader.js".into()).is_fatal());
        assert!(
            Error::Bootstrap {
                step: "globals",
                message: "SyntaxError".into()
            }
            .is_fatal()
        );
        assert!(Error::BootstrapFailed("earlier".into()).is_fatal());
    }

    #[test]
    fn component_errors_are_not_fatal() {
        let err = Error::Evaluation {
            name: "foo.js".into(),
            message: "ReferenceError".into(),
        };
        assert!(!err.is_fatal());
        assert!(!Error::InvalidName("../x".into()).is_fatal());
    }

    #[test]
    fn hook_error_names_hook_and_component() {
        let err = Error::Hook {
            name: "foo.js".into(),
            hook: "vertxStart",
            message: "Error: boom".into(),
        };
        let text = err.to_string();
        assert!(text.contains("vertxStart"));
        assert!(text.contains("foo.js"));
        assert!(text.contains("boom"));
    }
}
