//! Listeners and their per-registration options.

use collection_hooks_core::projection::Projection;
use collection_hooks_core::{HookOutcome, HookPayload, Result, Value};
use futures::future::{self, BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a listener, used to unregister it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type SyncHandler = dyn Fn(&HookPayload) -> Result<HookOutcome> + Send + Sync;
type AsyncHandler = dyn Fn(HookPayload) -> BoxFuture<'static, Result<HookOutcome>> + Send + Sync;
type Predicate = dyn Fn(&HookPayload) -> bool + Send + Sync;
type ProjectionFn = dyn Fn(Option<&Value>) -> Option<Projection> + Send + Sync;

#[derive(Clone)]
enum Handler {
    Sync(Arc<SyncHandler>),
    Async(Arc<AsyncHandler>),
}

/// Where a listener's projection comes from.
#[derive(Clone)]
enum ProjectionSource {
    Static(Projection),
    Computed(Arc<ProjectionFn>),
}

/// Per-registration options.
///
/// # Example
///
/// ```
/// use collection_hooks_core::projection::Projection;
/// use collection_hooks_runtime::listener::HookOptions;
///
/// let options = HookOptions::new()
///     .with_projection(Projection::include(["status"]))
///     .with_fetch_previous(true);
///
/// assert!(options.fetch_previous());
/// assert_eq!(options.projection_for(None), Some(Projection::include(["status"])));
/// ```
#[derive(Clone, Default)]
pub struct HookOptions {
    should_run: Option<Arc<Predicate>>,
    projection: Option<ProjectionSource>,
    fetch_previous: bool,
    fetch_previous_projection: Option<Projection>,
    greedy_fetch: bool,
}

impl HookOptions {
    /// Options with every feature off.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the listener only when `predicate` accepts the payload.
    #[must_use]
    pub fn with_should_run<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&HookPayload) -> bool + Send + Sync + 'static,
    {
        self.should_run = Some(Arc::new(predicate));
        self
    }

    /// Fields of the record this listener reads through `get_document`.
    #[must_use]
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(ProjectionSource::Static(projection));
        self
    }

    /// Compute the projection from the operation's original arguments.
    #[must_use]
    pub fn with_projection_fn<F>(mut self, compute: F) -> Self
    where
        F: Fn(Option<&Value>) -> Option<Projection> + Send + Sync + 'static,
    {
        self.projection = Some(ProjectionSource::Computed(Arc::new(compute)));
        self
    }

    /// Expose the record as it was before the operation as `previousDocument`.
    #[must_use]
    pub const fn with_fetch_previous(mut self, fetch_previous: bool) -> Self {
        self.fetch_previous = fetch_previous;
        self
    }

    /// Fields needed in `previousDocument`.
    #[must_use]
    pub fn with_fetch_previous_projection(mut self, projection: Projection) -> Self {
        self.fetch_previous_projection = Some(projection);
        self
    }

    /// Read whole matched records while locating them, instead of only their ids.
    #[must_use]
    pub const fn with_greedy_fetch(mut self, greedy_fetch: bool) -> Self {
        self.greedy_fetch = greedy_fetch;
        self
    }

    /// Whether the listener should run for `payload`.
    #[must_use]
    pub fn should_run(&self, payload: &HookPayload) -> bool {
        self.should_run
            .as_ref()
            .is_none_or(|predicate| predicate(payload))
    }

    /// The projection declared for an operation called with `args_orig`.
    ///
    /// `None` means the listener needs the whole record.
    #[must_use]
    pub fn projection_for(&self, args_orig: Option<&Value>) -> Option<Projection> {
        match &self.projection {
            None => None,
            Some(ProjectionSource::Static(projection)) => Some(projection.clone()),
            Some(ProjectionSource::Computed(compute)) => compute(args_orig),
        }
    }

    /// Whether `previousDocument` was requested.
    #[must_use]
    pub const fn fetch_previous(&self) -> bool {
        self.fetch_previous
    }

    /// Fields requested for `previousDocument`.
    #[must_use]
    pub const fn fetch_previous_projection(&self) -> Option<&Projection> {
        self.fetch_previous_projection.as_ref()
    }

    /// Whether greedy fetching was requested.
    #[must_use]
    pub const fn greedy_fetch(&self) -> bool {
        self.greedy_fetch
    }
}

impl fmt::Debug for HookOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookOptions")
            .field("should_run", &self.should_run.is_some())
            .field("projection", &self.projection.is_some())
            .field("fetch_previous", &self.fetch_previous)
            .field("fetch_previous_projection", &self.fetch_previous_projection)
            .field("greedy_fetch", &self.greedy_fetch)
            .finish()
    }
}

/// A registered callback.
///
/// Listeners are cheap to clone; clones share the handler and the id.
///
/// # Example
///
/// ```
/// use collection_hooks_core::{HookOutcome, json};
/// use collection_hooks_runtime::listener::Listener;
///
/// let stamp = Listener::sync(|payload| {
///     let mut doc = payload.doc.clone().unwrap_or_default();
///     doc["createdBy"] = json!("importer");
///     Ok(HookOutcome::Replace(doc))
/// });
///
/// let audit = Listener::new_async(|payload| async move {
///     tracing::info!(operation = %payload.operation, "audit");
///     Ok(HookOutcome::Continue)
/// });
///
/// assert!(!stamp.is_async());
/// assert!(audit.is_async());
/// assert_ne!(stamp.id(), audit.id());
/// ```
#[derive(Clone)]
pub struct Listener {
    id: ListenerId,
    handler: Handler,
    options: HookOptions,
}

impl Listener {
    /// A listener that completes without suspending.
    ///
    /// Only synchronous listeners may take part in synchronous dispatch
    /// (cursor `rewind`).
    pub fn sync<F>(handler: F) -> Self
    where
        F: Fn(&HookPayload) -> Result<HookOutcome> + Send + Sync + 'static,
    {
        Self {
            id: ListenerId::next(),
            handler: Handler::Sync(Arc::new(handler)),
            options: HookOptions::default(),
        }
    }

    /// A listener returning a future. It receives its own copy of the payload.
    pub fn new_async<F, Fut>(handler: F) -> Self
    where
        F: Fn(HookPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookOutcome>> + Send + 'static,
    {
        Self {
            id: ListenerId::next(),
            handler: Handler::Async(Arc::new(move |payload| handler(payload).boxed())),
            options: HookOptions::default(),
        }
    }

    /// Attach options.
    #[must_use]
    pub fn with_options(mut self, options: HookOptions) -> Self {
        self.options = options;
        self
    }

    /// Identity used by `off`.
    #[must_use]
    pub const fn id(&self) -> ListenerId {
        self.id
    }

    /// Registration options.
    #[must_use]
    pub const fn options(&self) -> &HookOptions {
        &self.options
    }

    /// Whether the handler returns a future.
    #[must_use]
    pub const fn is_async(&self) -> bool {
        matches!(self.handler, Handler::Async(_))
    }

    /// Start the handler. Synchronous handlers run before this returns.
    pub(crate) fn invoke(&self, payload: &HookPayload) -> BoxFuture<'static, Result<HookOutcome>> {
        match &self.handler {
            Handler::Sync(handler) => future::ready(handler(payload)).boxed(),
            Handler::Async(handler) => handler(payload.clone()),
        }
    }

    /// Run a synchronous handler; `None` for asynchronous ones.
    pub(crate) fn invoke_sync(&self, payload: &HookPayload) -> Option<Result<HookOutcome>> {
        match &self.handler {
            Handler::Sync(handler) => Some(handler(payload)),
            Handler::Async(_) => None,
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("async", &self.is_async())
            .field("options", &self.options)
            .finish()
    }
}
