//! Error types shared by every hooked operation.
//!
//! Two layers exist:
//!
//! - [`StoreError`] is what the underlying document store reports.
//! - [`HookError`] is what every orchestrated call returns. It wraps store
//!   failures and adds listener failures, cancellation and usage errors.
//!
//! Both types are `Clone`: a single pending document fetch may be awaited by
//! many listeners, and each awaiter receives its own copy of the failure.

use thiserror::Error;

/// Errors reported by a [`DocumentStore`](crate::store::DocumentStore) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The addressed record or collection does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A write (insert, update, replace, delete) was rejected
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// A read (find, aggregate, count) could not be executed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// The store does not implement the requested capability
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Generic error for other failures
    #[error("Store error: {0}")]
    Other(String),
}

/// Errors produced by a hooked operation.
///
/// # Taxonomy
///
/// - [`HookError::Listener`]: a before/after handler failed. Always propagated.
/// - [`HookError::Store`]: the wrapped store call (or an incidental document
///   fetch) failed.
/// - [`HookError::Aborted`]: the call was cancelled through an abort signal.
///   Cancellation is never collected into a batch error list.
/// - [`HookError::Batch`]: one or more per-record sub-invocations of a fan-out
///   operation failed.
#[derive(Error, Debug, Clone)]
pub enum HookError {
    /// A listener returned an error
    #[error("Listener on '{event}' failed: {message}")]
    Listener {
        /// The event the failing listener was registered on
        event: String,
        /// The listener's error message
        message: String,
    },

    /// The underlying store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The call was cancelled
    #[error("Operation aborted: {reason}")]
    Aborted {
        /// Reason supplied to the abort signal
        reason: String,
    },

    /// An asynchronous listener was reached by a synchronous chain
    #[error("Synchronous dispatch of '{event}' reached an asynchronous listener")]
    SyncChainViolation {
        /// The event being dispatched synchronously
        event: String,
    },

    /// An event name could not be parsed
    #[error("Invalid event name: {0}")]
    InvalidEventName(String),

    /// Arguments or results could not be converted to or from JSON
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Per-record sub-invocations of a fan-out operation failed
    #[error("{} record operation(s) failed; first: {}", errors.len(), first_message(errors))]
    Batch {
        /// Every collected error, in the order it was observed
        errors: Vec<HookError>,
    },
}

fn first_message(errors: &[HookError]) -> String {
    errors
        .first()
        .map_or_else(|| "none".to_string(), ToString::to_string)
}

impl HookError {
    /// Build a listener error for `event` from any displayable error.
    pub fn listener(event: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Listener {
            event: event.into(),
            message: message.to_string(),
        }
    }

    /// Build a cancellation error.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Whether this error is a cancellation.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

impl From<serde_json::Error> for HookError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Lets handler code use `anyhow` and `?` freely.
///
/// The event name is not known at conversion time; the orchestrator reports
/// it through tracing when the error surfaces.
impl From<anyhow::Error> for HookError {
    fn from(err: anyhow::Error) -> Self {
        Self::Listener {
            event: "<handler>".to_string(),
            message: format!("{err:#}"),
        }
    }
}

/// Result alias for hooked operations.
pub type Result<T> = std::result::Result<T, HookError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_distinct() {
        assert!(HookError::aborted("shutdown").is_cancellation());
        assert!(!HookError::listener("before.insert", "nope").is_cancellation());
        assert!(!HookError::from(StoreError::Other("x".into())).is_cancellation());
    }

    #[test]
    fn test_batch_message_names_first_error() {
        let err = HookError::Batch {
            errors: vec![
                HookError::listener("before.insert", "bad doc"),
                HookError::from(StoreError::WriteFailed("dup key".into())),
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 record operation(s) failed"));
        assert!(msg.contains("bad doc"));
    }

    #[test]
    fn test_anyhow_maps_to_listener_error() {
        let err: HookError = anyhow::anyhow!("handler exploded").into();
        assert!(matches!(err, HookError::Listener { ref message, .. } if message == "handler exploded"));
    }
}
