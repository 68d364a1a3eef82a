//! The invocation lifecycle.
//!
//! Every hooked call runs through [`Orchestrator::try_catch_emit`]:
//!
//! ```text
//! Init ──► Before ──► Operation ──► AfterSuccess ──► Done
//!            │            │
//!            │ Skip       └──► AfterError ──► Done (error re-raised)
//!            └──────────────────────────────► Done (skipped)
//! ```
//!
//! - **Init**: a fresh [`InvocationId`] is allocated. If no listener exists
//!   for any phase of the event the operation runs right away with the
//!   caller's arguments: no payload, no serialization, no metrics.
//! - **Before**: the argument record is serialized into the payload's chain
//!   slot and threaded through the before-listeners. A listener returning
//!   [`HookOutcome::Skip`](collection_hooks_core::HookOutcome::Skip) ends the
//!   invocation: neither the operation nor any after-listener runs.
//! - **Operation**: the caller's closure runs with the (possibly replaced)
//!   arguments and the invocation id, which nested calls record as their
//!   parent.
//! - **AfterSuccess**: the result is threaded through the after-success
//!   listeners; the final value is what the caller gets. A failure here
//!   propagates as is, without an after-error pass.
//! - **AfterError**: when the operation failed, the after-error listeners run
//!   in parallel with the error attached, then the error is returned. A
//!   failing error-listener replaces it.
//!
//! Listener errors raised in the before phase propagate without an
//! after-error pass, as does cancellation.

use collection_hooks_core::projection::{Projection, union_of_projections};
use collection_hooks_core::{ChainKey, DocumentStore, HookError, HookPayload, InvocationId, Phase, Result, Value};
use serde::Serialize;
use serde::de::DeserializeOwned;
use smallvec::SmallVec;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::abort::AbortSignal;
use crate::bus::{Chained, EventBus, EventSet, ListenerSet};
use crate::cache::DocumentCache;
use crate::config::HooksConfig;
use crate::metrics::{INVOCATION_DURATION_SECONDS, INVOCATIONS_SKIPPED_TOTAL, INVOCATIONS_TOTAL};

/// Describes one orchestrated event.
///
/// # Example
///
/// ```
/// use collection_hooks_core::ChainKey;
/// use collection_hooks_core::event::targets;
/// use collection_hooks_runtime::orchestrator::Emit;
///
/// let emit = Emit::new(targets::INSERT, ChainKey::Doc).caller(targets::INSERT_MANY);
/// assert_eq!(emit.target(), "insert");
/// ```
#[derive(Clone, Debug)]
pub struct Emit {
    target: &'static str,
    aliases: SmallVec<[&'static str; 2]>,
    chain: ChainKey,
    parent: Option<InvocationId>,
    caller: Option<&'static str>,
}

impl Emit {
    /// Event for `target`, threading `chain` through its before-listeners.
    #[must_use]
    pub fn new(target: &'static str, chain: ChainKey) -> Self {
        Self {
            target,
            aliases: SmallVec::new(),
            chain,
            parent: None,
            caller: None,
        }
    }

    /// Also dispatch to listeners of `alias`.
    #[must_use]
    pub fn alias(mut self, alias: &'static str) -> Self {
        self.aliases.push(alias);
        self
    }

    /// Record `parent` as the invocation that caused this one.
    #[must_use]
    pub const fn parent(mut self, parent: Option<InvocationId>) -> Self {
        self.parent = parent;
        self
    }

    /// Public operation that triggered this nested invocation.
    #[must_use]
    pub const fn caller(mut self, caller: &'static str) -> Self {
        self.caller = Some(caller);
        self
    }

    /// Master target.
    #[must_use]
    pub const fn target(&self) -> &'static str {
        self.target
    }

    /// Every name this event dispatches to in `phase`.
    #[must_use]
    pub fn events(&self, phase: Phase, wildcard: bool) -> EventSet {
        self.aliases
            .iter()
            .copied()
            .fold(EventSet::new(phase, self.target), |set, alias| set.with_alias(alias))
            .with_wildcard(wildcard)
    }
}

/// How an orchestrated call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Emitted<R> {
    /// The operation ran; this is its (possibly replaced) result
    Completed(R),
    /// A before-listener vetoed the invocation
    Skipped,
}

impl<R> Emitted<R> {
    /// The result, if the operation ran.
    pub fn completed(self) -> Option<R> {
        match self {
            Self::Completed(result) => Some(result),
            Self::Skipped => None,
        }
    }

    /// The result, or `default()` when skipped.
    pub fn unwrap_or_else(self, default: impl FnOnce() -> R) -> R {
        self.completed().unwrap_or_else(default)
    }
}

/// Runs hooked calls against an [`EventBus`].
///
/// Cheap to clone; clones share the bus.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    bus: Arc<EventBus>,
    config: HooksConfig,
}

struct Phases {
    before: EventSet,
    success: EventSet,
    error: EventSet,
}

impl Orchestrator {
    /// Orchestrator over `bus`.
    #[must_use]
    pub const fn new(bus: Arc<EventBus>, config: HooksConfig) -> Self {
        Self { bus, config }
    }

    /// The listener registry.
    #[must_use]
    pub const fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Settings.
    #[must_use]
    pub const fn config(&self) -> &HooksConfig {
        &self.config
    }

    fn phases(&self, emit: &Emit) -> Phases {
        let wildcard = self.config.emit_wildcard();
        Phases {
            before: emit.events(Phase::Before, wildcard),
            success: emit.events(Phase::AfterSuccess, wildcard),
            error: emit.events(Phase::AfterError, wildcard),
        }
    }

    /// Whether any phase of `emit` has a listener.
    #[must_use]
    pub fn has_listeners(&self, emit: &Emit) -> bool {
        if self.bus.is_empty() {
            return false;
        }
        let phases = self.phases(emit);
        self.bus.has_listeners(&phases.before)
            || self.bus.has_listeners(&phases.success)
            || self.bus.has_listeners(&phases.error)
    }

    /// Listeners of every phase of `emit`.
    #[must_use]
    pub fn listeners_for(&self, emit: &Emit) -> ListenerSet {
        let phases = self.phases(emit);
        let mut listeners = self.bus.collect(&phases.before);
        listeners.extend(self.bus.collect(&phases.success));
        listeners.extend(self.bus.collect(&phases.error));
        listeners
    }

    /// Document cache for the records of `emit`.
    ///
    /// Reads use the union of every participating listener's projection and
    /// previous-document projection; a listener without a projection needs
    /// the whole record. With no listener the cache never reads.
    #[must_use]
    pub fn document_cache_for(
        &self,
        emit: &Emit,
        store: Arc<dyn DocumentStore>,
        args_orig: Option<&Value>,
        signal: AbortSignal,
    ) -> DocumentCache {
        let listeners = self.listeners_for(emit);
        if listeners.is_empty() {
            return DocumentCache::no_fetch(signal);
        }
        let mut specs: Vec<Option<Projection>> = Vec::with_capacity(listeners.len());
        for listener in &listeners {
            let options = listener.options();
            specs.push(options.projection_for(args_orig));
            if options.fetch_previous() {
                specs.push(options.fetch_previous_projection().cloned());
            }
        }
        let projection = union_of_projections(specs.iter().map(Option::as_ref));
        DocumentCache::new(store, projection, signal)
    }

    /// Run `operation` inside the before/after lifecycle of `emit`.
    ///
    /// `payload` builds the event-specific part of the listener payload from
    /// the invocation id and the original arguments; it is only called when
    /// listeners exist.
    ///
    /// # Errors
    ///
    /// A listener error, the operation's error (after the error-listeners
    /// ran), or a serialization error when a listener replaced the
    /// arguments or the result with a value of the wrong shape.
    pub async fn try_catch_emit<A, R, P, F, Fut>(
        &self,
        emit: &Emit,
        args: A,
        payload: P,
        operation: F,
    ) -> Result<Emitted<R>>
    where
        A: Serialize + DeserializeOwned,
        R: Serialize + DeserializeOwned,
        P: FnOnce(InvocationId, &A) -> HookPayload,
        F: FnOnce(A, InvocationId) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let invocation = InvocationId::new();
        if !self.has_listeners(emit) {
            return operation(args, invocation).await.map(Emitted::Completed);
        }

        let started = Instant::now();
        let phases = self.phases(emit);
        metrics::counter!(INVOCATIONS_TOTAL, "operation" => emit.target).increment(1);
        tracing::debug!(
            operation = emit.target,
            invocation = %invocation,
            parent = ?emit.parent,
            caller = ?emit.caller,
            "hooked invocation"
        );

        let mut payload = self.prepare(emit, invocation, payload(invocation, &args));
        let args = match self.before(&phases.before, emit.chain, &mut payload, args).await {
            Ok(Some(args)) => args,
            Ok(None) => {
                metrics::counter!(INVOCATIONS_SKIPPED_TOTAL).increment(1);
                return Ok(Emitted::Skipped);
            },
            Err(error) => return Err(self.after_error(&phases.error, &mut payload, error).await),
        };
        if let Err(error) = self.fetch_previous(&phases, &mut payload).await {
            return Err(self.after_error(&phases.error, &mut payload, error).await);
        }

        let outcome = match operation(args, invocation).await {
            Ok(result) => self.after_success(&phases.success, &mut payload, result).await,
            Err(error) => Err(self.after_error(&phases.error, &mut payload, error).await),
        };
        metrics::histogram!(INVOCATION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        outcome.map(Emitted::Completed)
    }

    /// [`Orchestrator::try_catch_emit`] for operations that must not suspend.
    ///
    /// # Errors
    ///
    /// As [`Orchestrator::try_catch_emit`], plus
    /// [`HookError::SyncChainViolation`] if an asynchronous listener is
    /// registered for the event.
    pub fn try_catch_emit_sync<A, R, P, F>(&self, emit: &Emit, args: A, payload: P, operation: F) -> Result<Emitted<R>>
    where
        A: Serialize + DeserializeOwned,
        R: Serialize + DeserializeOwned,
        P: FnOnce(InvocationId, &A) -> HookPayload,
        F: FnOnce(A, InvocationId) -> Result<R>,
    {
        let invocation = InvocationId::new();
        if !self.has_listeners(emit) {
            return operation(args, invocation).map(Emitted::Completed);
        }

        let phases = self.phases(emit);
        metrics::counter!(INVOCATIONS_TOTAL, "operation" => emit.target).increment(1);
        tracing::debug!(operation = emit.target, invocation = %invocation, "hooked synchronous invocation");

        let mut payload = self.prepare(emit, invocation, payload(invocation, &args));
        let args = match self.before_sync(&phases.before, emit.chain, &mut payload, args) {
            Ok(Some(args)) => args,
            Ok(None) => {
                metrics::counter!(INVOCATIONS_SKIPPED_TOTAL).increment(1);
                return Ok(Emitted::Skipped);
            },
            Err(error) => return Err(self.after_error_sync(&phases.error, &mut payload, error)),
        };

        match operation(args, invocation) {
            Ok(result) => {
                if !self.bus.has_listeners(&phases.success) {
                    return Ok(Emitted::Completed(result));
                }
                payload.operation = phases.success.master_event();
                payload.begin_chain(ChainKey::Result, serde_json::to_value(&result)?);
                self.bus
                    .invoke_all_chained_sync(&phases.success, &mut payload, ChainKey::Result)?;
                match replaced_value(&payload, ChainKey::Result) {
                    Some(replaced) => Ok(Emitted::Completed(serde_json::from_value(replaced)?)),
                    None => Ok(Emitted::Completed(result)),
                }
            },
            Err(error) => Err(self.after_error_sync(&phases.error, &mut payload, error)),
        }
    }

    fn prepare(&self, emit: &Emit, invocation: InvocationId, mut payload: HookPayload) -> HookPayload {
        payload.invocation_symbol = invocation;
        payload.parent_invocation_symbol = emit.parent;
        payload.caller = emit.caller.map(str::to_string);
        if let Some(namespace) = self.config.namespace() {
            namespace.clone_into(&mut payload.this_arg);
        }
        payload
    }

    /// Returns the arguments to run with, or `None` when skipped.
    async fn before<A>(&self, set: &EventSet, chain: ChainKey, payload: &mut HookPayload, args: A) -> Result<Option<A>>
    where
        A: Serialize + DeserializeOwned,
    {
        payload.begin_chain(chain, serde_json::to_value(&args)?);
        if !self.bus.has_listeners(set) {
            return Ok(Some(args));
        }
        payload.operation = set.master_event();
        if self.bus.invoke_all_chained(set, payload, chain).await? == Chained::Skipped {
            tracing::debug!(operation = %payload.operation, invocation = %payload.invocation_symbol, "invocation skipped");
            return Ok(None);
        }
        match replaced_value(payload, chain) {
            Some(replaced) => Ok(Some(serde_json::from_value(replaced)?)),
            None => Ok(Some(args)),
        }
    }

    fn before_sync<A>(&self, set: &EventSet, chain: ChainKey, payload: &mut HookPayload, args: A) -> Result<Option<A>>
    where
        A: Serialize + DeserializeOwned,
    {
        if !self.bus.has_listeners(set) {
            return Ok(Some(args));
        }
        payload.operation = set.master_event();
        payload.begin_chain(chain, serde_json::to_value(&args)?);
        if self.bus.invoke_all_chained_sync(set, payload, chain)? == Chained::Skipped {
            return Ok(None);
        }
        match replaced_value(payload, chain) {
            Some(replaced) => Ok(Some(serde_json::from_value(replaced)?)),
            None => Ok(Some(args)),
        }
    }

    async fn fetch_previous(&self, phases: &Phases, payload: &mut HookPayload) -> Result<()> {
        if payload.id.is_none() {
            return Ok(());
        }
        let wanted = self
            .bus
            .collect(&phases.success)
            .iter()
            .chain(self.bus.collect(&phases.error).iter())
            .any(|listener| listener.options().fetch_previous());
        if wanted {
            payload.previous_document = payload.get_document().await?;
        }
        Ok(())
    }

    async fn after_success<R>(&self, set: &EventSet, payload: &mut HookPayload, result: R) -> Result<R>
    where
        R: Serialize + DeserializeOwned,
    {
        if !self.bus.has_listeners(set) {
            return Ok(result);
        }
        payload.operation = set.master_event();
        payload.begin_chain(ChainKey::Result, serde_json::to_value(&result)?);
        self.bus.invoke_all_chained(set, payload, ChainKey::Result).await?;
        match replaced_value(payload, ChainKey::Result) {
            Some(replaced) => Ok(serde_json::from_value(replaced)?),
            None => Ok(result),
        }
    }

    /// Returns the error the caller should see.
    async fn after_error(&self, set: &EventSet, payload: &mut HookPayload, error: HookError) -> HookError {
        if error.is_cancellation() || !self.bus.has_listeners(set) {
            return error;
        }
        tracing::warn!(
            operation = %set.master_event(),
            invocation = %payload.invocation_symbol,
            %error,
            "operation failed"
        );
        payload.operation = set.master_event();
        payload.error = Some(error.clone());
        match self.bus.invoke_all_in_parallel(set, payload).await {
            Ok(()) => error,
            Err(listener_error) => listener_error,
        }
    }

    fn after_error_sync(&self, set: &EventSet, payload: &mut HookPayload, error: HookError) -> HookError {
        if error.is_cancellation() || !self.bus.has_listeners(set) {
            return error;
        }
        tracing::warn!(
            operation = %set.master_event(),
            invocation = %payload.invocation_symbol,
            %error,
            "operation failed"
        );
        payload.operation = set.master_event();
        payload.error = Some(error.clone());
        match self.bus.invoke_all_sync(set, payload) {
            Ok(()) => error,
            Err(listener_error) => listener_error,
        }
    }
}

/// The running value of `key` if a listener replaced it.
fn replaced_value(payload: &HookPayload, key: ChainKey) -> Option<Value> {
    if payload.chained(key) == payload.chained_orig(key) {
        return None;
    }
    payload.chained(key).cloned()
}
