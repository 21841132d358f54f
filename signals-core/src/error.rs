//! Error types for the signal engine.
//!
//! Every fallible operation returns [`SignalResult`]. Errors are `Clone`
//! because a signal caches its last error and hands it back on every read
//! until a later computation succeeds.

use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type SignalResult<T> = Result<T, SignalError>;

/// Errors raised by signals, computations and the engine itself.
#[derive(Debug, Clone, Error)]
pub enum SignalError {
    /// A compute function or handler failed with an arbitrary error.
    #[error("{0}")]
    Compute(Arc<dyn std::error::Error + Send + Sync>),

    /// A compute function or handler failed with a plain message.
    #[error("{0}")]
    Message(String),

    /// Both the compute function and its fallback failed.
    #[error("signal `{signal}` failed ({error}) and its fallback failed too ({fallback})")]
    Fallback {
        signal: String,
        error: Box<SignalError>,
        fallback: Box<SignalError>,
    },

    /// Work was attempted inside a superseded computation epoch.
    ///
    /// This is a sentinel: it is never reported through `on_error` callbacks
    /// or the devtools error hook.
    #[error("computation was aborted")]
    Aborted,

    /// A mutation was attempted on a disposed signal.
    #[error("signal `{0}` is disposed")]
    Disposed(String),

    /// A signal was read but holds neither a value nor an error.
    #[error("signal `{0}` has not been computed")]
    NotComputed(String),

    /// A computation asked for a dependency that was never declared.
    #[error("unknown dependency `{0}`")]
    UnknownDependency(String),

    /// A declared dependency holds a value of a different type.
    #[error("dependency `{name}` does not hold a `{expected}`")]
    DependencyType { name: String, expected: &'static str },

    /// The engine was configured in a way it cannot honor.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// One or more cleanups failed while disposing.
    #[error("{} cleanup(s) failed during disposal", .0.len())]
    Disposal(Vec<SignalError>),
}

impl SignalError {
    /// Wrap an arbitrary error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Compute(Arc::new(error))
    }

    /// Build an error from a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Combine a compute failure with the failure of its fallback.
    pub fn fallback(signal: impl Into<String>, error: SignalError, fallback: SignalError) -> Self {
        Self::Fallback {
            signal: signal.into(),
            error: Box::new(error),
            fallback: Box::new(fallback),
        }
    }

    /// Whether this is the aborted-computation sentinel.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
