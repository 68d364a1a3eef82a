//! Recording listeners
//!
//! A [`Recorder`] hands out listeners that push a copy of every payload they
//! receive into one shared log, so a test can assert which events fired, in
//! which order, and with what data.

use collection_hooks_core::{HookOutcome, HookPayload};
use collection_hooks_runtime::Listener;
use std::sync::{Arc, Mutex, PoisonError};

/// Shared log of observed payloads.
///
/// Clones share the log.
///
/// # Example
///
/// ```
/// use collection_hooks_core::json;
/// use collection_hooks_runtime::{CallOptions, HookedCollection};
/// use collection_hooks_testing::{InMemoryStore, Recorder};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let users = HookedCollection::new(Arc::new(InMemoryStore::new("users")));
/// let recorder = Recorder::new();
/// users.on("before.insert", recorder.listener()).unwrap();
/// users.on("after.insert", recorder.listener()).unwrap();
///
/// users.insert_one(json!({"_id": 1}), &CallOptions::default()).await.unwrap();
/// assert_eq!(recorder.events(), ["before.insert", "after.insert.success"]);
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct Recorder {
    payloads: Arc<Mutex<Vec<HookPayload>>>,
}

impl Recorder {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, payload: &HookPayload) {
        self.payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload.clone());
    }

    /// A synchronous listener that records and continues
    #[must_use]
    pub fn listener(&self) -> Listener {
        self.responding(|_| HookOutcome::Continue)
    }

    /// A synchronous listener that records, then answers with `respond`
    #[must_use]
    pub fn responding<F>(&self, respond: F) -> Listener
    where
        F: Fn(&HookPayload) -> HookOutcome + Send + Sync + 'static,
    {
        let recorder = self.clone();
        Listener::sync(move |payload| {
            recorder.record(payload);
            Ok(respond(payload))
        })
    }

    /// An asynchronous listener that yields to the scheduler once, then records
    #[must_use]
    pub fn async_listener(&self) -> Listener {
        let recorder = self.clone();
        Listener::new_async(move |payload: HookPayload| {
            let recorder = recorder.clone();
            async move {
                tokio::task::yield_now().await;
                recorder.record(&payload);
                Ok(HookOutcome::Continue)
            }
        })
    }

    /// Every recorded payload, oldest first
    #[must_use]
    pub fn payloads(&self) -> Vec<HookPayload> {
        self.payloads.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The `operation` of every recorded payload, oldest first
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|payload| payload.operation.clone())
            .collect()
    }

    /// The most recent payload
    #[must_use]
    pub fn last(&self) -> Option<HookPayload> {
        self.payloads.lock().unwrap_or_else(PoisonError::into_inner).last().cloned()
    }

    /// Number of recorded payloads
    #[must_use]
    pub fn len(&self) -> usize {
        self.payloads.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.payloads.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
