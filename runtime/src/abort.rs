//! Cooperative cancellation.
//!
//! An [`AbortSignal`] never interrupts a running listener or store call. It is
//! checked at fixed points (before each batch item, before dispatching each
//! unordered batch, before and after each document fetch) and makes the
//! surrounding call fail with [`HookError::Aborted`].

use collection_hooks_core::{HookError, Result};
use std::sync::Arc;
use tokio::sync::watch;

/// Clonable cancellation token; every clone observes the same state.
///
/// # Example
///
/// ```
/// use collection_hooks_runtime::abort::AbortSignal;
///
/// let signal = AbortSignal::new();
/// let handle = signal.clone();
/// assert!(signal.check().is_ok());
///
/// handle.abort("client went away");
/// assert!(signal.is_aborted());
/// assert!(signal.check().unwrap_err().is_cancellation());
/// ```
#[derive(Clone, Debug)]
pub struct AbortSignal {
    state: Arc<watch::Sender<Option<String>>>,
}

impl AbortSignal {
    /// A signal that has not been aborted.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    /// Abort with `reason`. Later calls keep the first reason.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// Whether [`AbortSignal::abort`] has been called.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// The abort reason, if aborted.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.state.borrow().clone()
    }

    /// Fail if aborted.
    ///
    /// # Errors
    ///
    /// Returns [`HookError::Aborted`] carrying the abort reason.
    pub fn check(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(HookError::aborted(reason)),
            None => Ok(()),
        }
    }

    /// Resolves once the signal is aborted.
    pub async fn cancelled(&self) {
        let mut changes = self.state.subscribe();
        // Only fails when every sender is gone, which cannot happen while `self` lives.
        let _ = changes.wait_for(Option::is_some).await;
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let signal = AbortSignal::new();
        signal.abort("first");
        signal.abort("second");
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let signal = AbortSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        signal.abort("stop");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_after_abort_is_immediate() {
        let signal = AbortSignal::new();
        signal.abort("already");
        tokio_test::assert_ready!(tokio_test::task::spawn(signal.cancelled()).poll());
    }
}
