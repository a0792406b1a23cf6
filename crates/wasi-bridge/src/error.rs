//! Error types used by the bridge.
//! Instantiation-phase variants are fatal to a load attempt, the rest are scoped to a single call.

use anyhow::Error as AnyError;
use thiserror::Error;

use crate::trace::AbortSignal;
use crate::vfs::VfsError;

#[derive(Debug, Error)]
pub enum Error {
    /// The module bytes could not be read or fetched
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// The bytes are not a valid core wasm module
    #[error("module load failed: {0}")]
    ModuleLoad(String),
    /// Import resolution or instantiation failed
    #[error("link failed: {0}")]
    Link(String),
    /// An export registration hook failed
    #[error("registration hook {hook} failed: {reason}")]
    Registration { hook: String, reason: String },
    /// The module aborted, trapped or called `proc_exit` during a call
    #[error("{0}")]
    Abort(Box<AbortSignal>),
    /// Work could not be handed to (or completed by) the worker pool
    #[error("worker dispatch failed: {0}")]
    WorkerDispatch(String),
    /// Requested item is not found
    #[error("not found: {0}")]
    NotFound(String),
    /// Supplied arguments/options/config is invalid
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Errors from the in-memory filesystem
    #[error("{0}")]
    Vfs(#[from] VfsError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Error while parsing JSON
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Any other error
    #[error("{0}")]
    Any(#[from] AnyError),
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

impl From<AbortSignal> for Error {
    fn from(signal: AbortSignal) -> Self {
        Error::Abort(Box::new(signal))
    }
}

impl Error {
    /// Returns the abort signal if this error came from a module abort.
    pub fn as_abort(&self) -> Option<&AbortSignal> {
        match self {
            Error::Abort(signal) => Some(signal),
            _ => None,
        }
    }

    /// Whether this error belongs to the instantiation phase.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Error::SourceUnavailable(_)
                | Error::ModuleLoad(_)
                | Error::Link(_)
                | Error::Registration { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_errors_are_classified() {
        assert!(Error::SourceUnavailable("x".into()).is_load_error());
        assert!(Error::ModuleLoad("x".into()).is_load_error());
        assert!(Error::Link("x".into()).is_load_error());
        assert!(
            Error::Registration {
                hook: "h".into(),
                reason: "r".into()
            }
            .is_load_error()
        );
        assert!(!Error::WorkerDispatch("x".into()).is_load_error());
        assert!(!Error::NotFound("x".into()).is_load_error());
    }

    #[test]
    fn test_error_messages() {
        let e = Error::Registration {
            hook: "__napi_register__Foo_struct_0".to_string(),
            reason: "boom".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "registration hook __napi_register__Foo_struct_0 failed: boom"
        );

        let e = Error::NotFound("Foo".to_string());
        assert_eq!(e.to_string(), "not found: Foo");

        let e: Error = VfsError::NotFound("/missing".to_string()).into();
        assert_eq!(e.to_string(), "no such file or directory: /missing");
    }
}
