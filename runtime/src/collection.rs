//! The hooked collection façade.
//!
//! [`HookedCollection`] wraps a [`DocumentStore`] and runs every public
//! operation through the [`Orchestrator`]. Operations that touch several
//! records additionally fan out into per-record events:
//!
//! | Public operation | Per-record event | Chained value |
//! |---|---|---|
//! | `insertOne`, `insertMany` | `insert` | the document |
//! | `updateOne`, `updateMany`, `replaceOne` | `update` | `{filter, mutator}` or `{filter, replacement}` |
//! | `deleteOne`, `deleteMany` | `delete` | `{filter}` |
//! | `findOneAndUpdate`, `findOneAndReplace` | `update` | as above |
//! | `findOneAndDelete` | `delete` | `{filter}` |
//!
//! Per-record sub-invocations record the public invocation as their parent
//! and the public operation as their caller. When no per-record listener is
//! registered the store's bulk operation runs directly.
//!
//! # Example
//!
//! ```
//! use collection_hooks_core::{HookOutcome, json};
//! use collection_hooks_runtime::{CallOptions, HookedCollection, Listener};
//! use collection_hooks_testing::InMemoryStore;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let users = HookedCollection::new(Arc::new(InMemoryStore::new("users")));
//! users
//!     .on(
//!         "before.insert",
//!         Listener::sync(|payload| {
//!             let mut doc = payload.doc.clone().unwrap_or_default();
//!             doc["createdBy"] = json!("hooks");
//!             Ok(HookOutcome::Replace(doc))
//!         }),
//!     )
//!     .unwrap();
//!
//! let inserted = users.insert_one(json!({"_id": 1}), &CallOptions::default()).await.unwrap();
//! assert_eq!(inserted.inserted_id, json!(1));
//!
//! let stored = users.find_one(json!({"_id": 1}), Default::default(), &CallOptions::default()).await.unwrap();
//! assert_eq!(stored, Some(json!({"_id": 1, "createdBy": "hooks"})));
//! # });
//! ```

use collection_hooks_core::args::{
    AggregateArgs, CountArgs, DeleteArgs, DistinctArgs, FindArgs, FindOneAndDeleteArgs, FindOneAndOptions,
    FindOneAndReplaceArgs, FindOneAndUpdateArgs, FindOptions, InsertManyArgs, InsertManyOptions, InsertOneArgs,
    ReplaceArgs, UpdateArgs, UpdateOptions,
};
use collection_hooks_core::document::{ID_FIELD, id_of, with_id};
use collection_hooks_core::event::targets;
use collection_hooks_core::projection::Projection;
use collection_hooks_core::results::{DeleteResult, InsertManyResult, InsertOneResult, UpdateResult};
use collection_hooks_core::{
    ChainKey, CursorKind, DocumentStore, EventName, HookError, HookPayload, InvocationId, Result, StoreError,
    Value,
};
use futures::{StreamExt, TryStreamExt, future};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::batch::{ItemOutcome, run_batched};
use crate::bus::EventBus;
use crate::cache::DocumentCache;
use crate::config::{CallOptions, HooksConfig};
use crate::cursor::{CursorSource, HookedCursor};
use crate::listener::{Listener, ListenerId};
use crate::orchestrator::{Emit, Emitted, Orchestrator};

/// Arguments of one per-record `update` or `delete` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordWrite {
    filter: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mutator: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    replacement: Option<Value>,
}

impl RecordWrite {
    fn update(filter: Value, mutator: Value) -> Self {
        Self {
            filter,
            mutator: Some(mutator),
            replacement: None,
        }
    }

    fn replace(filter: Value, replacement: Value) -> Self {
        Self {
            filter,
            mutator: None,
            replacement: Some(replacement),
        }
    }

    fn delete(filter: Value) -> Self {
        Self {
            filter,
            mutator: None,
            replacement: None,
        }
    }

    fn narrowed(&self, id: &Value) -> Self {
        Self {
            filter: with_id(&self.filter, id),
            mutator: self.mutator.clone(),
            replacement: self.replacement.clone(),
        }
    }

    fn fill(&self, payload: &mut HookPayload) {
        payload.filter = Some(self.filter.clone());
        payload.mutator.clone_from(&self.mutator);
        payload.replacement.clone_from(&self.replacement);
    }

    /// `(filter, mutator or replacement)`
    fn into_body(self) -> Result<(Value, Value)> {
        let body = self.mutator.or(self.replacement).ok_or_else(|| {
            HookError::Serialization("record write has neither a mutator nor a replacement".to_string())
        })?;
        Ok((self.filter, body))
    }
}

/// Public arguments as the caller passed them.
///
/// Captured when the public event has listeners, which may replace them;
/// otherwise the arguments reach the operation unchanged and are rebuilt from
/// the record template on demand.
#[derive(Default)]
struct OriginalArgs(OnceLock<Value>);

impl OriginalArgs {
    fn capture<A: Serialize>(&self, args: &A) {
        if let Ok(value) = serde_json::to_value(args) {
            let _ = self.0.set(value);
        }
    }

    fn get_or(&self, rebuild: impl FnOnce() -> Result<Value>) -> Result<Value> {
        self.0.get().map_or_else(rebuild, |value| Ok(value.clone()))
    }
}

/// `{filter, mutator|replacement, options}`, the shape of the public arguments.
fn public_args<O: Serialize>(template: &RecordWrite, options: Option<&O>) -> Result<Value> {
    let mut args = serde_json::to_value(template)?;
    if let (Some(options), Value::Object(fields)) = (options, &mut args) {
        fields.insert("options".to_string(), serde_json::to_value(options)?);
    }
    Ok(args)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Modify {
    UpdateOne,
    UpdateMany,
    ReplaceOne,
}

impl Modify {
    const fn target(self) -> &'static str {
        match self {
            Self::UpdateOne => targets::UPDATE_ONE,
            Self::UpdateMany => targets::UPDATE_MANY,
            Self::ReplaceOne => targets::REPLACE_ONE,
        }
    }

    const fn limit(self) -> Option<u64> {
        match self {
            Self::UpdateMany => None,
            Self::UpdateOne | Self::ReplaceOne => Some(1),
        }
    }

    /// The store call applied to one narrowed record.
    const fn per_record(self) -> Self {
        match self {
            Self::UpdateMany => Self::UpdateOne,
            other => other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FindAndModify {
    Update,
    Replace,
    Delete,
}

impl FindAndModify {
    const fn target(self) -> &'static str {
        match self {
            Self::Update => targets::FIND_ONE_AND_UPDATE,
            Self::Replace => targets::FIND_ONE_AND_REPLACE,
            Self::Delete => targets::FIND_ONE_AND_DELETE,
        }
    }

    const fn record_event(self) -> &'static str {
        match self {
            Self::Update | Self::Replace => targets::UPDATE,
            Self::Delete => targets::DELETE,
        }
    }
}

/// One per-record fan-out.
struct FanOut<'a> {
    emit: &'a Emit,
    filter: &'a Value,
    sort: Option<Value>,
    limit: Option<u64>,
    cache: &'a DocumentCache,
    greedy: bool,
    call: &'a CallOptions,
}

struct Matched<R> {
    count: u64,
    results: Vec<R>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A record collection whose operations emit hook events.
pub struct HookedCollection {
    store: Arc<dyn DocumentStore>,
    orchestrator: Orchestrator,
    this_arg: String,
}

impl HookedCollection {
    /// Wrap `store` with the default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_config(store, HooksConfig::default())
    }

    /// Wrap `store` with `config`.
    #[must_use]
    pub fn with_config(store: Arc<dyn DocumentStore>, config: HooksConfig) -> Self {
        let this_arg = config.namespace().unwrap_or_else(|| store.namespace()).to_string();
        Self {
            store,
            orchestrator: Orchestrator::new(Arc::new(EventBus::new()), config),
            this_arg,
        }
    }

    /// Register `listener` for the event named `event`.
    ///
    /// # Errors
    ///
    /// [`HookError::InvalidEventName`] if `event` does not parse.
    pub fn on(&self, event: &str, listener: Listener) -> Result<ListenerId> {
        let name: EventName = event.parse()?;
        Ok(self.on_event(name, listener))
    }

    /// Register `listener` for `name`.
    pub fn on_event(&self, name: EventName, listener: Listener) -> ListenerId {
        tracing::debug!(event = %name, "registering listener");
        self.orchestrator.bus().register(name, listener)
    }

    /// Remove a listener. Returns whether it was registered.
    ///
    /// # Errors
    ///
    /// [`HookError::InvalidEventName`] if `event` does not parse.
    pub fn off(&self, event: &str, id: ListenerId) -> Result<bool> {
        let name: EventName = event.parse()?;
        Ok(self.orchestrator.bus().unregister(&name, id))
    }

    /// The orchestrator, for wrapping custom operations.
    #[must_use]
    pub const fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// The wrapped store.
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// The collection name listeners see as `thisArg`.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.this_arg
    }

    fn payload(&self, invocation: InvocationId) -> HookPayload {
        HookPayload::new(invocation, self.this_arg.as_str())
    }

    fn emit(target: &'static str, call: &CallOptions) -> Emit {
        Emit::new(target, ChainKey::Args).parent(call.parent_invocation)
    }

    fn record_emit(event: &'static str, chain: ChainKey, parent: InvocationId, caller: &'static str) -> Emit {
        Emit::new(event, chain).parent(Some(parent)).caller(caller)
    }

    fn greedy(&self, emit: &Emit) -> bool {
        self.orchestrator
            .listeners_for(emit)
            .iter()
            .any(|listener| listener.options().greedy_fetch())
    }

    /// Computed projections see the public call's original arguments.
    fn record_cache(&self, emit: &Emit, args_orig: &Value, call: &CallOptions) -> DocumentCache {
        self.orchestrator
            .document_cache_for(emit, Arc::clone(&self.store), Some(args_orig), call.resolve_signal())
    }

    // ========================================================================
    // Inserts
    // ========================================================================

    /// Insert one document.
    ///
    /// # Errors
    ///
    /// A listener or store error.
    pub async fn insert_one(&self, document: Value, call: &CallOptions) -> Result<InsertOneResult> {
        let emit = Self::emit(targets::INSERT_ONE, call);
        let emitted = self
            .orchestrator
            .try_catch_emit(
                &emit,
                InsertOneArgs { document },
                |id, _| self.payload(id),
                |args, invocation| async move {
                    let inserted = self
                        .insert_record(args.document, invocation, targets::INSERT_ONE)
                        .await?;
                    Ok(inserted.unwrap_or_else(InsertOneResult::skipped))
                },
            )
            .await?;
        Ok(emitted.unwrap_or_else(InsertOneResult::skipped))
    }

    /// Insert several documents.
    ///
    /// With `insert` listeners registered every document is inserted through
    /// its own sub-invocation, ordered or unordered per `options.ordered`
    /// unless `call` overrides it.
    ///
    /// # Errors
    ///
    /// A listener or store error, or [`HookError::Batch`] with every
    /// per-document failure.
    pub async fn insert_many(
        &self,
        documents: Vec<Value>,
        options: InsertManyOptions,
        call: &CallOptions,
    ) -> Result<InsertManyResult> {
        let emit = Self::emit(targets::INSERT_MANY, call);
        let emitted = self
            .orchestrator
            .try_catch_emit(
                &emit,
                InsertManyArgs { documents, options },
                |id, _| self.payload(id),
                |args, invocation| async move { self.insert_records(args, invocation, call).await },
            )
            .await?;
        Ok(emitted.unwrap_or_else(InsertManyResult::default))
    }

    async fn insert_record(
        &self,
        document: Value,
        parent: InvocationId,
        caller: &'static str,
    ) -> Result<Emitted<InsertOneResult>> {
        let emit = Self::record_emit(targets::INSERT, ChainKey::Doc, parent, caller);
        self.orchestrator
            .try_catch_emit(
                &emit,
                document,
                |id, _| self.payload(id),
                |document, _| async move { Ok(self.store.insert_one(document).await?) },
            )
            .await
    }

    async fn insert_records(&self, args: InsertManyArgs, parent: InvocationId, call: &CallOptions) -> Result<InsertManyResult> {
        let per_record = Self::record_emit(targets::INSERT, ChainKey::Doc, parent, targets::INSERT_MANY);
        if !self.orchestrator.has_listeners(&per_record) {
            return Ok(self.store.insert_many(args.documents, args.options.ordered).await?);
        }

        let config = self.orchestrator.config();
        let ordered = call.ordered.unwrap_or(args.options.ordered);
        let inserted = &Mutex::new(BTreeMap::new());
        let items = futures::stream::iter(args.documents.into_iter().enumerate().map(Ok));
        let errors = run_batched(
            move |(index, document): (usize, Value)| async move {
                if let Emitted::Completed(result) = self.insert_record(document, parent, targets::INSERT_MANY).await? {
                    lock(inserted).insert(index, result.inserted_id);
                }
                Ok(ItemOutcome::proceed())
            },
            items,
            ordered,
            call.resolve_batch_size(config),
            &call.resolve_signal(),
            None,
        )
        .await?;
        if !errors.is_empty() {
            return Err(HookError::Batch { errors });
        }
        Ok(InsertManyResult {
            acknowledged: true,
            inserted_ids: std::mem::take(&mut *lock(inserted)),
        })
    }

    // ========================================================================
    // Updates
    // ========================================================================

    /// Update the first record matching `filter`.
    ///
    /// # Errors
    ///
    /// A listener or store error, or [`HookError::Batch`].
    pub async fn update_one(
        &self,
        filter: Value,
        mutator: Value,
        options: UpdateOptions,
        call: &CallOptions,
    ) -> Result<UpdateResult> {
        self.update(Modify::UpdateOne, filter, mutator, options, call).await
    }

    /// Update every record matching `filter`.
    ///
    /// # Errors
    ///
    /// A listener or store error, or [`HookError::Batch`].
    pub async fn update_many(
        &self,
        filter: Value,
        mutator: Value,
        options: UpdateOptions,
        call: &CallOptions,
    ) -> Result<UpdateResult> {
        self.update(Modify::UpdateMany, filter, mutator, options, call).await
    }

    /// Replace the first record matching `filter`.
    ///
    /// # Errors
    ///
    /// A listener or store error, or [`HookError::Batch`].
    pub async fn replace_one(
        &self,
        filter: Value,
        replacement: Value,
        options: UpdateOptions,
        call: &CallOptions,
    ) -> Result<UpdateResult> {
        let emit = Self::emit(targets::REPLACE_ONE, call);
        let original = &OriginalArgs::default();
        let emitted = self
            .orchestrator
            .try_catch_emit(
                &emit,
                ReplaceArgs {
                    filter,
                    replacement,
                    options,
                },
                |id, args| {
                    original.capture(args);
                    self.payload(id)
                },
                |args, invocation| async move {
                    let template = RecordWrite::replace(args.filter, args.replacement);
                    self.modify_records(Modify::ReplaceOne, template, args.options, original, invocation, call)
                        .await
                },
            )
            .await?;
        Ok(emitted.unwrap_or_else(UpdateResult::default))
    }

    async fn update(
        &self,
        how: Modify,
        filter: Value,
        mutator: Value,
        options: UpdateOptions,
        call: &CallOptions,
    ) -> Result<UpdateResult> {
        let emit = Self::emit(how.target(), call);
        let original = &OriginalArgs::default();
        let emitted = self
            .orchestrator
            .try_catch_emit(
                &emit,
                UpdateArgs {
                    filter,
                    mutator,
                    options,
                },
                |id, args| {
                    original.capture(args);
                    self.payload(id)
                },
                |args, invocation| async move {
                    let template = RecordWrite::update(args.filter, args.mutator);
                    self.modify_records(how, template, args.options, original, invocation, call)
                        .await
                },
            )
            .await?;
        Ok(emitted.unwrap_or_else(UpdateResult::default))
    }

    async fn modify(&self, how: Modify, write: RecordWrite, options: UpdateOptions) -> Result<UpdateResult> {
        let (filter, body) = write.into_body()?;
        let result = match how {
            Modify::UpdateOne => self.store.update_one(filter, body, options).await?,
            Modify::UpdateMany => self.store.update_many(filter, body, options).await?,
            Modify::ReplaceOne => self.store.replace_one(filter, body, options).await?,
        };
        Ok(result)
    }

    async fn modify_records(
        &self,
        how: Modify,
        template: RecordWrite,
        options: UpdateOptions,
        original: &OriginalArgs,
        parent: InvocationId,
        call: &CallOptions,
    ) -> Result<UpdateResult> {
        let emit = Self::record_emit(targets::UPDATE, ChainKey::Args, parent, how.target());
        if !self.orchestrator.has_listeners(&emit) {
            return self.modify(how, template, options).await;
        }

        let args_orig = original.get_or(|| public_args(&template, Some(&options)))?;
        let cache = self.record_cache(&emit, &args_orig, call);
        let per_record = how.per_record();
        let options = &options;
        let op = move |write: RecordWrite| self.modify(per_record, write, options.clone());
        let plan = FanOut {
            emit: &emit,
            filter: &template.filter,
            sort: None,
            limit: how.limit(),
            cache: &cache,
            greedy: self.greedy(&emit),
            call,
        };
        let matched = self.fan_out(plan, &template, &op).await?;

        let mut total = UpdateResult {
            acknowledged: true,
            ..UpdateResult::default()
        };
        for result in &matched.results {
            total.absorb(result);
        }
        if matched.count == 0 && options.upsert {
            tracing::debug!(operation = how.target(), "no record matched, upserting");
            if let Emitted::Completed(result) = self.run_record(&emit, None, template.clone(), &cache, &op).await? {
                total.absorb(&result);
            }
        }
        Ok(total)
    }

    // ========================================================================
    // Deletes
    // ========================================================================

    /// Delete the first record matching `filter`.
    ///
    /// # Errors
    ///
    /// A listener or store error, or [`HookError::Batch`].
    pub async fn delete_one(&self, filter: Value, call: &CallOptions) -> Result<DeleteResult> {
        self.delete(targets::DELETE_ONE, filter, call).await
    }

    /// Delete every record matching `filter`.
    ///
    /// `deleteMany` listeners see the ids of the matched records in `_ids`.
    /// The ids are read before anything is deleted, so any `deleteMany`
    /// listener, after-phase ones included, costs one extra `_id` scan of
    /// `filter`. Without such listeners nothing is scanned up front.
    ///
    /// # Errors
    ///
    /// A listener or store error, or [`HookError::Batch`].
    pub async fn delete_many(&self, filter: Value, call: &CallOptions) -> Result<DeleteResult> {
        self.delete(targets::DELETE_MANY, filter, call).await
    }

    async fn delete(&self, target: &'static str, filter: Value, call: &CallOptions) -> Result<DeleteResult> {
        let emit = Self::emit(target, call);
        let original = &OriginalArgs::default();
        let (ids, documents) = if target == targets::DELETE_MANY && self.orchestrator.has_listeners(&emit) {
            let ids = self.scan_ids(&filter).await?;
            let args_orig = serde_json::to_value(DeleteArgs { filter: filter.clone() })?;
            let cache = self
                .orchestrator
                .document_cache_for(&emit, Arc::clone(&self.store), Some(&args_orig), call.resolve_signal());
            (Some(ids), Some(cache))
        } else {
            (None, None)
        };

        let emitted = self
            .orchestrator
            .try_catch_emit(
                &emit,
                DeleteArgs { filter },
                |id, args| {
                    original.capture(args);
                    let mut payload = self.payload(id);
                    payload.ids = ids;
                    match documents {
                        Some(cache) => payload.with_documents(Arc::new(cache)),
                        None => payload,
                    }
                },
                |args, invocation| async move {
                    self.delete_records(target, args.filter, original, invocation, call)
                        .await
                },
            )
            .await?;
        Ok(emitted.unwrap_or_else(DeleteResult::default))
    }

    async fn scan_ids(&self, filter: &Value) -> Result<Vec<Value>> {
        let options = FindOptions::projected(Some(Projection::include([ID_FIELD])));
        let records: Vec<Value> = self.store.find(filter.clone(), options).try_collect().await?;
        Ok(records.iter().filter_map(id_of).cloned().collect())
    }

    async fn remove(&self, write: RecordWrite) -> Result<DeleteResult> {
        Ok(self.store.delete_one(write.filter).await?)
    }

    async fn delete_records(
        &self,
        caller: &'static str,
        filter: Value,
        original: &OriginalArgs,
        parent: InvocationId,
        call: &CallOptions,
    ) -> Result<DeleteResult> {
        let many = caller == targets::DELETE_MANY;
        let emit = Self::record_emit(targets::DELETE, ChainKey::Args, parent, caller);
        if !self.orchestrator.has_listeners(&emit) {
            let result = if many {
                self.store.delete_many(filter).await?
            } else {
                self.store.delete_one(filter).await?
            };
            return Ok(result);
        }

        let template = RecordWrite::delete(filter);
        let args_orig = original.get_or(|| public_args::<()>(&template, None))?;
        let cache = self.record_cache(&emit, &args_orig, call);
        let op = move |write: RecordWrite| self.remove(write);
        let plan = FanOut {
            emit: &emit,
            filter: &template.filter,
            sort: None,
            limit: if many { None } else { Some(1) },
            cache: &cache,
            greedy: self.greedy(&emit),
            call,
        };
        let matched = self.fan_out(plan, &template, &op).await?;

        let mut total = DeleteResult {
            acknowledged: true,
            deleted_count: 0,
        };
        for result in &matched.results {
            total.absorb(result);
        }
        Ok(total)
    }

    // ========================================================================
    // Find-and-modify
    // ========================================================================

    /// Update the first record matching `filter` and return it.
    ///
    /// # Errors
    ///
    /// A listener or store error, or [`HookError::Batch`].
    pub async fn find_one_and_update(
        &self,
        filter: Value,
        mutator: Value,
        options: FindOneAndOptions,
        call: &CallOptions,
    ) -> Result<Option<Value>> {
        let emit = Self::emit(targets::FIND_ONE_AND_UPDATE, call);
        let original = &OriginalArgs::default();
        let emitted = self
            .orchestrator
            .try_catch_emit(
                &emit,
                FindOneAndUpdateArgs {
                    filter,
                    mutator,
                    options,
                },
                |id, args| {
                    original.capture(args);
                    self.payload(id)
                },
                |args, invocation| async move {
                    let template = RecordWrite::update(args.filter, args.mutator);
                    self.find_and_modify_records(
                        FindAndModify::Update,
                        template,
                        args.options,
                        original,
                        invocation,
                        call,
                    )
                    .await
                },
            )
            .await?;
        Ok(emitted.completed().flatten())
    }

    /// Replace the first record matching `filter` and return it.
    ///
    /// # Errors
    ///
    /// A listener or store error, or [`HookError::Batch`].
    pub async fn find_one_and_replace(
        &self,
        filter: Value,
        replacement: Value,
        options: FindOneAndOptions,
        call: &CallOptions,
    ) -> Result<Option<Value>> {
        let emit = Self::emit(targets::FIND_ONE_AND_REPLACE, call);
        let original = &OriginalArgs::default();
        let emitted = self
            .orchestrator
            .try_catch_emit(
                &emit,
                FindOneAndReplaceArgs {
                    filter,
                    replacement,
                    options,
                },
                |id, args| {
                    original.capture(args);
                    self.payload(id)
                },
                |args, invocation| async move {
                    let template = RecordWrite::replace(args.filter, args.replacement);
                    self.find_and_modify_records(
                        FindAndModify::Replace,
                        template,
                        args.options,
                        original,
                        invocation,
                        call,
                    )
                    .await
                },
            )
            .await?;
        Ok(emitted.completed().flatten())
    }

    /// Delete the first record matching `filter` and return it.
    ///
    /// # Errors
    ///
    /// A listener or store error, or [`HookError::Batch`].
    pub async fn find_one_and_delete(
        &self,
        filter: Value,
        options: FindOneAndOptions,
        call: &CallOptions,
    ) -> Result<Option<Value>> {
        let emit = Self::emit(targets::FIND_ONE_AND_DELETE, call);
        let original = &OriginalArgs::default();
        let emitted = self
            .orchestrator
            .try_catch_emit(
                &emit,
                FindOneAndDeleteArgs { filter, options },
                |id, args| {
                    original.capture(args);
                    self.payload(id)
                },
                |args, invocation| async move {
                    let template = RecordWrite::delete(args.filter);
                    self.find_and_modify_records(
                        FindAndModify::Delete,
                        template,
                        args.options,
                        original,
                        invocation,
                        call,
                    )
                    .await
                },
            )
            .await?;
        Ok(emitted.completed().flatten())
    }

    async fn find_and_modify(
        &self,
        how: FindAndModify,
        write: RecordWrite,
        options: FindOneAndOptions,
    ) -> Result<Option<Value>> {
        let document = match how {
            FindAndModify::Update => {
                let (filter, mutator) = write.into_body()?;
                self.store.find_one_and_update(filter, mutator, options).await?
            },
            FindAndModify::Replace => {
                let (filter, replacement) = write.into_body()?;
                self.store.find_one_and_replace(filter, replacement, options).await?
            },
            FindAndModify::Delete => self.store.find_one_and_delete(write.filter, options).await?,
        };
        Ok(document)
    }

    async fn find_and_modify_records(
        &self,
        how: FindAndModify,
        template: RecordWrite,
        options: FindOneAndOptions,
        original: &OriginalArgs,
        parent: InvocationId,
        call: &CallOptions,
    ) -> Result<Option<Value>> {
        let emit = Self::record_emit(how.record_event(), ChainKey::Args, parent, how.target());
        if !self.orchestrator.has_listeners(&emit) {
            return self.find_and_modify(how, template, options).await;
        }

        let args_orig = original.get_or(|| public_args(&template, Some(&options)))?;
        let cache = self.record_cache(&emit, &args_orig, call);
        let options = &options;
        let op = move |write: RecordWrite| self.find_and_modify(how, write, options.clone());
        let plan = FanOut {
            emit: &emit,
            filter: &template.filter,
            sort: options.sort.clone(),
            limit: Some(1),
            cache: &cache,
            greedy: self.greedy(&emit),
            call,
        };
        let matched = self.fan_out(plan, &template, &op).await?;

        if matched.count == 0 && options.upsert && how != FindAndModify::Delete {
            let upserted = self.run_record(&emit, None, template.clone(), &cache, &op).await?;
            return Ok(upserted.completed().flatten());
        }
        Ok(matched.results.into_iter().next().flatten())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// The first record matching `filter`.
    ///
    /// # Errors
    ///
    /// A listener or store error.
    pub async fn find_one(&self, filter: Value, options: FindOptions, call: &CallOptions) -> Result<Option<Value>> {
        let emit = Self::emit(targets::FIND_ONE, call);
        let emitted = self
            .orchestrator
            .try_catch_emit(
                &emit,
                FindArgs { filter, options },
                |id, _| self.payload(id),
                |args, _| async move { Ok(self.store.find_one(args.filter, args.options).await?) },
            )
            .await?;
        Ok(emitted.completed().flatten())
    }

    /// A hooked cursor over the records matching `filter`.
    ///
    /// Records are read lazily. A skipped `find` yields an empty cursor.
    ///
    /// # Errors
    ///
    /// A listener error.
    pub async fn find(&self, filter: Value, options: FindOptions, call: &CallOptions) -> Result<HookedCursor> {
        let emit = Self::emit(targets::FIND, call);
        let mut opened = None;
        self.orchestrator
            .try_catch_emit(
                &emit,
                FindArgs { filter, options },
                |id, _| self.payload(id),
                |args, invocation| {
                    opened = Some((
                        CursorSource::Find {
                            filter: args.filter,
                            options: args.options,
                        },
                        invocation,
                    ));
                    future::ready(Ok(()))
                },
            )
            .await?;
        Ok(self.cursor(CursorKind::Find, opened))
    }

    /// A hooked cursor over the output of `pipeline`.
    ///
    /// # Errors
    ///
    /// A listener error.
    pub async fn aggregate(&self, pipeline: Vec<Value>, call: &CallOptions) -> Result<HookedCursor> {
        let emit = Self::emit(targets::AGGREGATE, call);
        let mut opened = None;
        self.orchestrator
            .try_catch_emit(
                &emit,
                AggregateArgs { pipeline },
                |id, _| self.payload(id),
                |args, invocation| {
                    opened = Some((CursorSource::Aggregate { pipeline: args.pipeline }, invocation));
                    future::ready(Ok(()))
                },
            )
            .await?;
        Ok(self.cursor(CursorKind::Aggregate, opened))
    }

    fn cursor(&self, kind: CursorKind, opened: Option<(CursorSource, InvocationId)>) -> HookedCursor {
        let (source, parent) = match opened {
            Some((source, invocation)) => (source, Some(invocation)),
            None => (CursorSource::Empty, None),
        };
        HookedCursor::new(
            kind,
            source,
            Arc::clone(&self.store),
            self.orchestrator.clone(),
            self.this_arg.clone(),
            parent,
        )
    }

    /// Number of records matching `filter`.
    ///
    /// # Errors
    ///
    /// A listener or store error.
    pub async fn count_documents(&self, filter: Value, call: &CallOptions) -> Result<u64> {
        let emit = Self::emit(targets::COUNT_DOCUMENTS, call);
        let emitted = self
            .orchestrator
            .try_catch_emit(
                &emit,
                CountArgs { filter },
                |id, _| self.payload(id),
                |args, _| async move { Ok(self.store.count_documents(args.filter).await?) },
            )
            .await?;
        Ok(emitted.completed().unwrap_or_default())
    }

    /// The store's estimate of the collection size.
    ///
    /// # Errors
    ///
    /// A listener or store error.
    pub async fn estimated_document_count(&self, call: &CallOptions) -> Result<u64> {
        let emit = Self::emit(targets::ESTIMATED_DOCUMENT_COUNT, call);
        let emitted = self
            .orchestrator
            .try_catch_emit(
                &emit,
                (),
                |id, _| self.payload(id),
                |(), _| async move { Ok(self.store.estimated_document_count().await?) },
            )
            .await?;
        Ok(emitted.completed().unwrap_or_default())
    }

    /// Distinct values of `key` among the records matching `filter`.
    ///
    /// # Errors
    ///
    /// A listener or store error.
    pub async fn distinct(&self, key: &str, filter: Value, call: &CallOptions) -> Result<Vec<Value>> {
        let emit = Self::emit(targets::DISTINCT, call);
        let emitted = self
            .orchestrator
            .try_catch_emit(
                &emit,
                DistinctArgs {
                    key: key.to_string(),
                    filter,
                },
                |id, _| self.payload(id),
                |args, _| async move { Ok(self.store.distinct(args.key, args.filter).await?) },
            )
            .await?;
        Ok(emitted.completed().unwrap_or_default())
    }

    // ========================================================================
    // Fan-out
    // ========================================================================

    /// Locate the records of `plan` and run one sub-invocation per record.
    async fn fan_out<R, Op, Fut>(&self, plan: FanOut<'_>, template: &RecordWrite, op: &Op) -> Result<Matched<R>>
    where
        R: Serialize + DeserializeOwned,
        Op: Fn(RecordWrite) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let FanOut {
            emit,
            filter,
            sort,
            limit,
            cache,
            greedy,
            call,
        } = plan;
        // Greedy listeners may drop `_id`; the scan still needs it.
        let projection = if greedy {
            cache.projection().cloned().map(Projection::keep_id)
        } else {
            Some(Projection::include([ID_FIELD]))
        };
        let options = FindOptions {
            projection,
            sort,
            limit,
            skip: None,
        };
        let records = self
            .store
            .find(filter.clone(), options)
            .map(|record| record.map_err(HookError::from));

        let config = self.orchestrator.config();
        let matched = &AtomicU64::new(0);
        let results = &Mutex::new(Vec::new());
        let errors = run_batched(
            move |record: Value| async move {
                let Some(id) = id_of(&record).cloned() else {
                    return Err(StoreError::QueryFailed(format!("scanned record has no {ID_FIELD}")).into());
                };
                matched.fetch_add(1, Ordering::Relaxed);
                let args = template.narrowed(&id);
                if greedy {
                    cache.set_document(&id, Some(record));
                }
                if let Emitted::Completed(result) = self.run_record(emit, Some(id), args, cache, op).await? {
                    lock(results).push(result);
                }
                Ok(ItemOutcome::proceed())
            },
            records,
            call.resolve_ordered(config),
            call.resolve_batch_size(config),
            &call.resolve_signal(),
            None,
        )
        .await?;

        let count = matched.load(Ordering::Relaxed);
        tracing::debug!(event = emit.target(), matched = count, failed = errors.len(), "fan-out finished");
        if !errors.is_empty() {
            return Err(HookError::Batch { errors });
        }
        Ok(Matched {
            count,
            results: std::mem::take(&mut *lock(results)),
        })
    }

    async fn run_record<R, Op, Fut>(
        &self,
        emit: &Emit,
        id: Option<Value>,
        args: RecordWrite,
        cache: &DocumentCache,
        op: &Op,
    ) -> Result<Emitted<R>>
    where
        R: Serialize + DeserializeOwned,
        Op: Fn(RecordWrite) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.orchestrator
            .try_catch_emit(
                emit,
                args,
                |invocation, args: &RecordWrite| {
                    let mut payload = self.payload(invocation).with_documents(Arc::new(cache.clone()));
                    payload.id = id;
                    args.fill(&mut payload);
                    payload
                },
                |args, _| op(args),
            )
            .await
    }
}

impl fmt::Debug for HookedCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookedCollection")
            .field("namespace", &self.this_arg)
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}
