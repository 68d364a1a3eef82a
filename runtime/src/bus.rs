//! The event bus.
//!
//! Listeners are stored per [`EventName`] in registration order. Dispatch
//! works on an [`EventSet`]: a *master* target plus zero or more *alias*
//! targets describing the same occurrence at a coarser granularity (and,
//! optionally, the `*` wildcard). The listeners of every name in the set form
//! one ordered group: master first, then aliases in order, then wildcard.
//!
//! # Strategies
//!
//! - **Parallel** ([`EventBus::invoke_all_in_parallel`]): every listener is
//!   started before any is awaited. The call waits for all of them to settle
//!   and then reports the first error, so one failure never prevents another
//!   listener from running.
//! - **Chained** ([`EventBus::invoke_all_chained`]): listeners run strictly
//!   one after another. Each sees the running value of the chain slot and may
//!   replace it; the `*Orig` slot stays at the pre-chain value.
//! - **Synchronous chain** ([`EventBus::invoke_all_chained_sync`]): as chained,
//!   but without suspending. Fails with [`HookError::SyncChainViolation`] if
//!   any listener in the set is asynchronous.
//!
//! Registration is synchronous and may happen while dispatches are in flight;
//! a dispatch works on the listeners registered when it started.

use collection_hooks_core::{ChainKey, EventName, HookError, HookOutcome, HookPayload, Phase, Result};
use futures::future::join_all;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::listener::{Listener, ListenerId};
use crate::metrics::LISTENERS_INVOKED_TOTAL;

/// Listeners selected for one dispatch.
pub type ListenerSet = SmallVec<[Listener; 4]>;

/// The names taking part in one dispatch.
///
/// # Example
///
/// ```
/// use collection_hooks_core::{EventName, Phase};
/// use collection_hooks_runtime::bus::EventSet;
///
/// let set = EventSet::new(Phase::Before, "find.cursor.next")
///     .with_alias("cursor.next")
///     .with_wildcard(true);
///
/// let names: Vec<String> = set.names().map(|name| name.to_string()).collect();
/// assert_eq!(names, ["before.find.cursor.next", "before.cursor.next", "*"]);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventSet {
    phase: Phase,
    master: &'static str,
    aliases: SmallVec<[&'static str; 2]>,
    wildcard: bool,
}

impl EventSet {
    /// Set containing only `phase` of `master`.
    #[must_use]
    pub fn new(phase: Phase, master: &'static str) -> Self {
        Self {
            phase,
            master,
            aliases: SmallVec::new(),
            wildcard: false,
        }
    }

    /// Add an alias target.
    #[must_use]
    pub fn with_alias(mut self, alias: &'static str) -> Self {
        self.aliases.push(alias);
        self
    }

    /// Include `*` listeners.
    #[must_use]
    pub const fn with_wildcard(mut self, wildcard: bool) -> Self {
        self.wildcard = wildcard;
        self
    }

    /// Phase of every name in the set.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Event string of the master name, e.g. `after.insert.success`.
    #[must_use]
    pub fn master_event(&self) -> String {
        self.phase.event_string(self.master)
    }

    /// Every name in dispatch order.
    pub fn names(&self) -> impl Iterator<Item = EventName> + '_ {
        std::iter::once(self.master)
            .chain(self.aliases.iter().copied())
            .map(|target| EventName::lifecycle(self.phase, target))
            .chain(self.wildcard.then_some(EventName::Wildcard))
    }
}

/// Result of a chained dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Chained {
    /// Every listener ran; the running value is in the payload's chain slot
    Finished,
    /// A before-listener returned [`HookOutcome::Skip`]
    Skipped,
}

/// Registry and dispatcher of listeners.
#[derive(Debug, Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventName, Vec<Listener>>>,
    count: AtomicUsize,
}

impl EventBus {
    /// An empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `listener` under `name`.
    ///
    /// Registering the same listener (same id) twice under one name is a no-op.
    pub fn register(&self, name: EventName, listener: Listener) -> ListenerId {
        let id = listener.id();
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let entry = listeners.entry(name).or_default();
        if !entry.iter().any(|existing| existing.id() == id) {
            entry.push(listener);
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        id
    }

    /// Remove listener `id` from `name`. Returns whether it was registered.
    pub fn unregister(&self, name: &EventName, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = listeners.get_mut(name) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|listener| listener.id() != id);
        let removed = entry.len() < before;
        if entry.is_empty() {
            listeners.remove(name);
        }
        if removed {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Listeners of `name` in registration order.
    #[must_use]
    pub fn listeners_of(&self, name: &EventName) -> Vec<Listener> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Whether nothing is registered at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any name in `set` has a listener.
    #[must_use]
    pub fn has_listeners(&self, set: &EventSet) -> bool {
        if self.is_empty() {
            return false;
        }
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        set.names().any(|name| listeners.contains_key(&name))
    }

    /// Listeners of every name in `set`, in dispatch order.
    #[must_use]
    pub fn collect(&self, set: &EventSet) -> ListenerSet {
        let mut selected = ListenerSet::new();
        if self.is_empty() {
            return selected;
        }
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for name in set.names() {
            if let Some(registered) = listeners.get(&name) {
                selected.extend(registered.iter().cloned());
            }
        }
        selected
    }

    /// Run the listeners of `name` concurrently.
    ///
    /// # Errors
    ///
    /// The first listener error, reported after every listener settled.
    pub async fn invoke_in_parallel(&self, name: &EventName, payload: &HookPayload) -> Result<()> {
        let listeners: ListenerSet = self.listeners_of(name).into_iter().collect();
        run_parallel(&listeners, &name.to_string(), phase_label(name), payload).await
    }

    /// Run the listeners of every name in `set` concurrently.
    ///
    /// # Errors
    ///
    /// The first listener error, reported after every listener settled.
    pub async fn invoke_all_in_parallel(&self, set: &EventSet, payload: &HookPayload) -> Result<()> {
        let listeners = self.collect(set);
        run_parallel(&listeners, &set.master_event(), set.phase().as_str(), payload).await
    }

    /// Run the listeners of `name` one after another, threading `key`.
    ///
    /// The caller starts the chain with [`HookPayload::begin_chain`].
    ///
    /// # Errors
    ///
    /// The first listener error; later listeners do not run.
    pub async fn invoke_chained(&self, name: &EventName, payload: &mut HookPayload, key: ChainKey) -> Result<Chained> {
        let listeners: ListenerSet = self.listeners_of(name).into_iter().collect();
        let allow_skip = matches!(name, EventName::Lifecycle { phase: Phase::Before, .. });
        run_chained(&listeners, &name.to_string(), phase_label(name), allow_skip, payload, key).await
    }

    /// Run the listeners of every name in `set` one after another, threading `key`.
    ///
    /// # Errors
    ///
    /// The first listener error; later listeners do not run.
    pub async fn invoke_all_chained(&self, set: &EventSet, payload: &mut HookPayload, key: ChainKey) -> Result<Chained> {
        let listeners = self.collect(set);
        let allow_skip = set.phase() == Phase::Before;
        run_chained(&listeners, &set.master_event(), set.phase().as_str(), allow_skip, payload, key).await
    }

    /// Chained dispatch that never suspends.
    ///
    /// # Errors
    ///
    /// [`HookError::SyncChainViolation`] before any listener runs if one of
    /// them is asynchronous; otherwise the first listener error.
    pub fn invoke_all_chained_sync(&self, set: &EventSet, payload: &mut HookPayload, key: ChainKey) -> Result<Chained> {
        let listeners = self.collect(set);
        let event = set.master_event();
        ensure_sync(&listeners, &event)?;
        let allow_skip = set.phase() == Phase::Before;
        for listener in &listeners {
            if !listener.options().should_run(payload) {
                continue;
            }
            count_invocation(set.phase().as_str());
            if let Some(outcome) = listener.invoke_sync(payload) {
                let step = apply_outcome(outcome, &event, allow_skip, payload, key)?;
                if step == Chained::Skipped {
                    return Ok(Chained::Skipped);
                }
            }
        }
        Ok(Chained::Finished)
    }

    /// Run every listener of `set` without suspending, all-settle like the
    /// parallel strategy.
    ///
    /// # Errors
    ///
    /// [`HookError::SyncChainViolation`] if a listener is asynchronous,
    /// otherwise the first listener error.
    pub fn invoke_all_sync(&self, set: &EventSet, payload: &HookPayload) -> Result<()> {
        let listeners = self.collect(set);
        let event = set.master_event();
        ensure_sync(&listeners, &event)?;
        let mut first_error = None;
        for listener in listeners.iter().filter(|listener| listener.options().should_run(payload)) {
            count_invocation(set.phase().as_str());
            if let Some(Err(err)) = listener.invoke_sync(payload) {
                first_error.get_or_insert_with(|| attribute(err, &event));
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn phase_label(name: &EventName) -> &'static str {
    match name {
        EventName::Lifecycle { phase, .. } => phase.as_str(),
        EventName::Wildcard => "wildcard",
    }
}

fn count_invocation(phase: &'static str) {
    metrics::counter!(LISTENERS_INVOKED_TOTAL, "phase" => phase).increment(1);
}

fn ensure_sync(listeners: &[Listener], event: &str) -> Result<()> {
    if listeners.iter().any(Listener::is_async) {
        return Err(HookError::SyncChainViolation {
            event: event.to_string(),
        });
    }
    Ok(())
}

/// Name the event on errors raised through `anyhow` conversion.
fn attribute(err: HookError, event: &str) -> HookError {
    match err {
        HookError::Listener { event: origin, message } if origin == "<handler>" => HookError::Listener {
            event: event.to_string(),
            message,
        },
        other => other,
    }
}

fn apply_outcome(
    outcome: Result<HookOutcome>,
    event: &str,
    allow_skip: bool,
    payload: &mut HookPayload,
    key: ChainKey,
) -> Result<Chained> {
    match outcome.map_err(|err| attribute(err, event))? {
        HookOutcome::Continue => Ok(Chained::Finished),
        HookOutcome::Replace(value) => {
            payload.set_chained(key, value);
            Ok(Chained::Finished)
        },
        HookOutcome::Skip if allow_skip => {
            tracing::debug!(event, "listener skipped invocation");
            Ok(Chained::Skipped)
        },
        HookOutcome::Skip => Ok(Chained::Finished),
    }
}

async fn run_parallel(listeners: &[Listener], event: &str, phase: &'static str, payload: &HookPayload) -> Result<()> {
    let pending: Vec<_> = listeners
        .iter()
        .filter(|listener| listener.options().should_run(payload))
        .map(|listener| {
            tracing::trace!(event, listener = %listener.id(), "dispatching listener");
            count_invocation(phase);
            listener.invoke(payload)
        })
        .collect();
    if pending.is_empty() {
        return Ok(());
    }
    let settled = join_all(pending).await;
    settled
        .into_iter()
        .find_map(Result::err)
        .map_or(Ok(()), |err| Err(attribute(err, event)))
}

async fn run_chained(
    listeners: &[Listener],
    event: &str,
    phase: &'static str,
    allow_skip: bool,
    payload: &mut HookPayload,
    key: ChainKey,
) -> Result<Chained> {
    for listener in listeners {
        if !listener.options().should_run(payload) {
            continue;
        }
        tracing::trace!(event, listener = %listener.id(), "dispatching chained listener");
        count_invocation(phase);
        let outcome = listener.invoke(payload).await;
        if apply_outcome(outcome, event, allow_skip, payload, key)? == Chained::Skipped {
            return Ok(Chained::Skipped);
        }
    }
    Ok(Chained::Finished)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use collection_hooks_core::{InvocationId, Value, json};
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn payload_with(key: ChainKey, value: Value) -> HookPayload {
        let mut payload = HookPayload::new(InvocationId::new(), "items");
        payload.begin_chain(key, value);
        payload
    }

    fn before(target: &'static str) -> EventSet {
        EventSet::new(Phase::Before, target)
    }

    #[test]
    fn test_register_is_idempotent_and_unregister_tolerates_strangers() {
        let bus = EventBus::new();
        let listener = Listener::sync(|_| Ok(HookOutcome::Continue));
        let name = EventName::before("insert");

        bus.register(name.clone(), listener.clone());
        bus.register(name.clone(), listener.clone());
        assert_eq!(bus.listeners_of(&name).len(), 1);
        assert_eq!(bus.len(), 1);

        let stranger = Listener::sync(|_| Ok(HookOutcome::Continue));
        assert!(!bus.unregister(&name, stranger.id()));
        assert!(bus.unregister(&name, listener.id()));
        assert!(bus.is_empty());
        assert!(!bus.unregister(&name, listener.id()));
    }

    #[test]
    fn test_listeners_keep_registration_order() {
        let bus = EventBus::new();
        let name = EventName::after_success("delete");
        let ids: Vec<_> = (0..5)
            .map(|_| bus.register(name.clone(), Listener::sync(|_| Ok(HookOutcome::Continue))))
            .collect();
        let listed: Vec<_> = bus.listeners_of(&name).iter().map(Listener::id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn test_set_orders_master_then_alias_then_wildcard() {
        let bus = EventBus::new();
        let wildcard = bus.register(EventName::Wildcard, Listener::sync(|_| Ok(HookOutcome::Continue)));
        let alias = bus.register(
            EventName::before("cursor.next"),
            Listener::sync(|_| Ok(HookOutcome::Continue)),
        );
        let master = bus.register(
            EventName::before("find.cursor.next"),
            Listener::sync(|_| Ok(HookOutcome::Continue)),
        );

        let set = before("find.cursor.next").with_alias("cursor.next").with_wildcard(true);
        let order: Vec<_> = bus.collect(&set).iter().map(Listener::id).collect();
        assert_eq!(order, [master, alias, wildcard]);

        let without_wildcard = before("find.cursor.next").with_alias("cursor.next");
        assert_eq!(bus.collect(&without_wildcard).len(), 2);
    }

    #[tokio::test]
    async fn test_chain_threads_value_and_keeps_original() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for step in 1..=3 {
            let seen = Arc::clone(&seen);
            bus.register(
                EventName::before("insert"),
                Listener::sync(move |payload| {
                    seen.lock().unwrap().push((payload.doc.clone(), payload.doc_orig.clone()));
                    let current = payload.doc.as_ref().and_then(Value::as_i64).unwrap();
                    Ok(HookOutcome::Replace(json!(current * 10 + step)))
                }),
            );
        }

        let mut payload = payload_with(ChainKey::Doc, json!(0));
        let outcome = bus
            .invoke_all_chained(&before("insert"), &mut payload, ChainKey::Doc)
            .await
            .unwrap();

        assert_eq!(outcome, Chained::Finished);
        assert_eq!(payload.doc, Some(json!(123)));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.iter().map(|(doc, _)| doc.clone().unwrap()).collect::<Vec<_>>(), [json!(0), json!(1), json!(12)]);
        assert!(seen.iter().all(|(_, orig)| *orig == Some(json!(0))));
    }

    #[tokio::test]
    async fn test_skip_short_circuits_before_chain_only() {
        let bus = EventBus::new();
        let ran_after_skip = Arc::new(Mutex::new(false));
        bus.register(EventName::before("delete"), Listener::sync(|_| Ok(HookOutcome::Skip)));
        bus.register(EventName::after_success("delete"), Listener::sync(|_| Ok(HookOutcome::Skip)));
        {
            let ran = Arc::clone(&ran_after_skip);
            let late = Listener::sync(move |_| {
                *ran.lock().unwrap() = true;
                Ok(HookOutcome::Continue)
            });
            bus.register(EventName::before("delete"), late.clone());
            bus.register(EventName::after_success("delete"), late);
        }

        let mut payload = payload_with(ChainKey::Args, json!({}));
        let outcome = bus
            .invoke_all_chained(&before("delete"), &mut payload, ChainKey::Args)
            .await
            .unwrap();
        assert_eq!(outcome, Chained::Skipped);
        assert!(!*ran_after_skip.lock().unwrap());

        let mut payload = payload_with(ChainKey::Result, json!({}));
        let outcome = bus
            .invoke_all_chained(&EventSet::new(Phase::AfterSuccess, "delete"), &mut payload, ChainKey::Result)
            .await
            .unwrap();
        assert_eq!(outcome, Chained::Finished);
        assert!(*ran_after_skip.lock().unwrap());
    }

    #[tokio::test]
    async fn test_parallel_waits_for_every_listener_before_failing() {
        let bus = EventBus::new();
        let finished = Arc::new(Mutex::new(0));
        bus.register(
            EventName::after_error("update"),
            Listener::sync(|_| Err(HookError::listener("after.update.error", "boom"))),
        );
        for delay in [20, 5] {
            let finished = Arc::clone(&finished);
            bus.register(
                EventName::after_error("update"),
                Listener::new_async(move |_| {
                    let finished = Arc::clone(&finished);
                    async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        *finished.lock().unwrap() += 1;
                        Ok(HookOutcome::Continue)
                    }
                }),
            );
        }

        let payload = payload_with(ChainKey::Args, json!({}));
        let err = bus
            .invoke_in_parallel(&EventName::after_error("update"), &payload)
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::Listener { ref message, .. } if message == "boom"));
        assert_eq!(*finished.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_parallel_starts_all_before_awaiting_any() {
        let bus = EventBus::new();
        let started = Arc::new(Mutex::new(0));
        let (release, gate) = tokio::sync::watch::channel(false);
        for _ in 0..3 {
            let started = Arc::clone(&started);
            let gate = gate.clone();
            bus.register(
                EventName::before("insert"),
                Listener::new_async(move |_| {
                    let started = Arc::clone(&started);
                    let mut gate = gate.clone();
                    async move {
                        *started.lock().unwrap() += 1;
                        gate.wait_for(|open| *open).await.unwrap();
                        Ok(HookOutcome::Continue)
                    }
                }),
            );
        }

        let payload = payload_with(ChainKey::Doc, json!({}));
        let events = before("insert");
        let dispatch = bus.invoke_all_in_parallel(&events, &payload);
        tokio::pin!(dispatch);
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut dispatch).await.is_err());
        assert_eq!(*started.lock().unwrap(), 3);

        release.send(true).unwrap();
        dispatch.await.unwrap();
    }

    #[tokio::test]
    async fn test_anyhow_errors_are_attributed_to_event() {
        let bus = EventBus::new();
        bus.register(
            EventName::before("insertOne"),
            Listener::sync(|_| Err(anyhow::anyhow!("no tenant").into())),
        );
        let mut payload = payload_with(ChainKey::Args, json!({}));
        let err = bus
            .invoke_all_chained(&before("insertOne"), &mut payload, ChainKey::Args)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HookError::Listener { ref event, ref message } if event == "before.insertOne" && message == "no tenant"
        ));
    }

    #[test]
    fn test_sync_chain_rejects_async_listener_before_running_anything() {
        let bus = EventBus::new();
        let ran = Arc::new(Mutex::new(false));
        {
            let ran = Arc::clone(&ran);
            bus.register(
                EventName::before("find.cursor.rewind"),
                Listener::sync(move |_| {
                    *ran.lock().unwrap() = true;
                    Ok(HookOutcome::Continue)
                }),
            );
        }
        bus.register(
            EventName::before("cursor.rewind"),
            Listener::new_async(|_| async { Ok(HookOutcome::Continue) }),
        );

        let set = before("find.cursor.rewind").with_alias("cursor.rewind");
        let mut payload = payload_with(ChainKey::Args, Value::Null);
        let err = bus.invoke_all_chained_sync(&set, &mut payload, ChainKey::Args).unwrap_err();
        assert!(matches!(err, HookError::SyncChainViolation { ref event } if event == "before.find.cursor.rewind"));
        assert!(!*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn test_should_run_gates_listener() {
        let bus = EventBus::new();
        bus.register(
            EventName::before("update"),
            Listener::sync(|_| Ok(HookOutcome::Replace(json!("changed"))))
                .with_options(crate::listener::HookOptions::new().with_should_run(|payload| payload.id.is_some())),
        );
        let mut payload = payload_with(ChainKey::Args, json!("original"));
        bus.invoke_all_chained(&before("update"), &mut payload, ChainKey::Args)
            .await
            .unwrap();
        assert_eq!(payload.args, Some(json!("original")));
    }

    proptest! {
        #[test]
        fn prop_chain_is_a_fold(steps in proptest::collection::vec((any::<bool>(), -100i64..100), 0..8), start in -100i64..100) {
            let bus = EventBus::new();
            for (replace, delta) in steps.clone() {
                bus.register(
                    EventName::after_success("findOne"),
                    Listener::sync(move |payload| {
                        if !replace {
                            return Ok(HookOutcome::Continue);
                        }
                        let orig = payload.result_orig.as_ref().and_then(Value::as_i64).unwrap();
                        let current = payload.result.as_ref().and_then(Value::as_i64).unwrap();
                        // The original never moves, whatever came before.
                        assert_eq!(orig, start);
                        Ok(HookOutcome::Replace(json!(current + delta)))
                    }),
                );
            }

            let mut payload = payload_with(ChainKey::Result, json!(start));
            let set = EventSet::new(Phase::AfterSuccess, "findOne");
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(bus.invoke_all_chained(&set, &mut payload, ChainKey::Result)).unwrap();

            let expected = steps.iter().filter(|(replace, _)| *replace).fold(start, |acc, (_, delta)| acc + delta);
            prop_assert_eq!(payload.result, Some(json!(expected)));
            prop_assert_eq!(payload.result_orig, Some(json!(start)));
        }
    }
}
