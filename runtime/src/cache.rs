//! Per-invocation document cache.
//!
//! Listeners of one orchestrated operation may each ask for the record they
//! are about. The cache makes every such request for the same id share a
//! single store read, issued with the union of the projections the
//! participating listeners declared.
//!
//! The check-and-insert of a pending entry happens under a mutex, so
//! concurrent requests from parallel listeners or unordered batch items still
//! collapse into one read. The read itself runs outside the lock.

use collection_hooks_core::args::FindOptions;
use collection_hooks_core::document::{DocumentId, with_id};
use collection_hooks_core::projection::Projection;
use collection_hooks_core::{DocumentLookup, DocumentStore, HookError, Result, Value};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::abort::AbortSignal;
use crate::metrics::{CACHE_FETCHES_TOTAL, CACHE_HITS_TOTAL};

type PendingFetch = Shared<BoxFuture<'static, Result<Option<Value>>>>;

enum Mode {
    /// No listener needs the record; requests resolve to `None`
    NoFetch,
    Fetch {
        store: Arc<dyn DocumentStore>,
        projection: Option<Projection>,
    },
}

struct Inner {
    mode: Mode,
    entries: Mutex<HashMap<DocumentId, PendingFetch>>,
    signal: AbortSignal,
}

/// Memoized record fetches for one orchestrated operation.
///
/// Clones share entries. Dropping the last clone discards them.
#[derive(Clone)]
pub struct DocumentCache {
    inner: Arc<Inner>,
}

impl DocumentCache {
    /// A cache that reads from `store` with `projection` (`None` reads whole records).
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, projection: Option<Projection>, signal: AbortSignal) -> Self {
        Self::with_mode(Mode::Fetch { store, projection }, signal)
    }

    /// A cache that never contacts the store.
    ///
    /// Seeded entries are still returned.
    #[must_use]
    pub fn no_fetch(signal: AbortSignal) -> Self {
        Self::with_mode(Mode::NoFetch, signal)
    }

    fn with_mode(mode: Mode, signal: AbortSignal) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                entries: Mutex::new(HashMap::new()),
                signal,
            }),
        }
    }

    /// Whether requests can reach the store.
    #[must_use]
    pub fn fetches(&self) -> bool {
        matches!(self.inner.mode, Mode::Fetch { .. })
    }

    /// The projection used for reads (`None` when reading whole records or not reading).
    #[must_use]
    pub fn projection(&self) -> Option<&Projection> {
        match &self.inner.mode {
            Mode::Fetch { projection, .. } => projection.as_ref(),
            Mode::NoFetch => None,
        }
    }

    /// The record `id`, read at most once per cache.
    ///
    /// # Errors
    ///
    /// [`HookError::Aborted`] if the signal fires before or after the read;
    /// otherwise the read's own failure, shared by every waiter.
    pub async fn get_document(&self, id: &Value) -> Result<Option<Value>> {
        self.inner.signal.check()?;
        let pending = self.entry(id);
        let document = pending.await;
        self.inner.signal.check()?;
        document
    }

    /// Seed the entry for `id` with a record read elsewhere.
    pub fn set_document(&self, id: &Value, document: Option<Value>) {
        let ready: BoxFuture<'static, Result<Option<Value>>> = future::ready(Ok(document)).boxed();
        self.lock().insert(DocumentId::from_value(id), ready.shared());
    }

    /// Number of ids with an entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no id has an entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DocumentId, PendingFetch>> {
        self.inner.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, id: &Value) -> PendingFetch {
        let key = DocumentId::from_value(id);
        let mut entries = self.lock();
        if let Some(pending) = entries.get(&key) {
            metrics::counter!(CACHE_HITS_TOTAL).increment(1);
            return pending.clone();
        }

        let fetch: BoxFuture<'static, Result<Option<Value>>> = match &self.inner.mode {
            Mode::NoFetch => future::ready(Ok(None)).boxed(),
            Mode::Fetch { store, projection } => {
                let store = Arc::clone(store);
                let filter = with_id(&Value::Null, id);
                let options = FindOptions::projected(projection.clone());
                metrics::counter!(CACHE_FETCHES_TOTAL).increment(1);
                tracing::debug!(id = %key, "fetching document");
                async move { store.find_one(filter, options).await.map_err(HookError::from) }.boxed()
            },
        };
        let pending = fetch.shared();
        entries.insert(key, pending.clone());
        pending
    }
}

impl DocumentLookup for DocumentCache {
    fn get_document(&self, id: &Value) -> BoxFuture<'static, Result<Option<Value>>> {
        let cache = self.clone();
        let id = id.clone();
        async move { cache.get_document(&id).await }.boxed()
    }
}

impl fmt::Debug for DocumentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentCache")
            .field("fetches", &self.fetches())
            .field("projection", &self.projection())
            .field("entries", &self.len())
            .finish()
    }
}
