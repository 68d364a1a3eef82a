//! Hooked cursors returned by `find` and `aggregate`.
//!
//! Every cursor operation is an orchestrated invocation whose parent is the
//! `find`/`aggregate` invocation that created the cursor. Events are emitted
//! under the kind-specific target (`find.cursor.next`) with the kind-agnostic
//! alias (`cursor.next`) participating after it.
//!
//! The underlying stream is opened on first read and reopened after
//! [`HookedCursor::rewind`].

use collection_hooks_core::args::FindOptions;
use collection_hooks_core::{
    ChainKey, CursorKind, CursorOp, DocumentStore, DocumentStream, HookPayload, InvocationId, Result, StoreError, Value,
};
use futures::{StreamExt, stream};
use std::fmt;
use std::sync::Arc;

use crate::orchestrator::{Emit, Orchestrator};

/// What a cursor reads.
#[derive(Clone, Debug)]
pub(crate) enum CursorSource {
    Find { filter: Value, options: FindOptions },
    Aggregate { pipeline: Vec<Value> },
    /// The creating call was skipped by a listener
    Empty,
}

/// A cursor whose operations run through the hook lifecycle.
pub struct HookedCursor {
    kind: CursorKind,
    source: CursorSource,
    store: Arc<dyn DocumentStore>,
    orchestrator: Orchestrator,
    this_arg: String,
    parent: Option<InvocationId>,
    stream: Option<DocumentStream>,
    closed: bool,
}

impl HookedCursor {
    pub(crate) fn new(
        kind: CursorKind,
        source: CursorSource,
        store: Arc<dyn DocumentStore>,
        orchestrator: Orchestrator,
        this_arg: String,
        parent: Option<InvocationId>,
    ) -> Self {
        Self {
            kind,
            source,
            store,
            orchestrator,
            this_arg,
            parent,
            stream: None,
            closed: false,
        }
    }

    /// `find` or `aggregate`.
    #[must_use]
    pub const fn kind(&self) -> CursorKind {
        self.kind
    }

    /// The invocation that created this cursor.
    #[must_use]
    pub const fn parent_invocation(&self) -> Option<InvocationId> {
        self.parent
    }

    /// Whether [`HookedCursor::close`] ran.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    fn emit(&self, op: CursorOp, parent: Option<InvocationId>) -> Emit {
        Emit::new(op.target(self.kind), ChainKey::Args)
            .alias(op.alias())
            .parent(parent)
            .caller(self.kind.creator())
    }

    fn open(source: &CursorSource, store: &Arc<dyn DocumentStore>) -> DocumentStream {
        match source {
            CursorSource::Find { filter, options } => store.find(filter.clone(), options.clone()),
            CursorSource::Aggregate { pipeline } => store.aggregate(pipeline.clone()),
            CursorSource::Empty => Box::pin(stream::empty()),
        }
    }

    /// Pull the next record; `None` when exhausted, closed, or skipped by a listener.
    ///
    /// # Errors
    ///
    /// A listener error or the stream's read error.
    pub async fn next(&mut self) -> Result<Option<Value>> {
        let parent = self.parent;
        self.next_within(parent).await
    }

    async fn next_within(&mut self, parent: Option<InvocationId>) -> Result<Option<Value>> {
        let emit = self.emit(CursorOp::Next, parent);
        let Self {
            source,
            store,
            orchestrator,
            this_arg,
            stream,
            closed,
            ..
        } = self;
        let emitted = orchestrator
            .try_catch_emit(
                &emit,
                Value::Null,
                |id, _| HookPayload::new(id, this_arg.as_str()),
                |_, _| async move {
                    if *closed {
                        return Ok(None);
                    }
                    let stream = stream.get_or_insert_with(|| Self::open(source, store));
                    Ok(stream.next().await.transpose()?)
                },
            )
            .await?;
        Ok(emitted.completed().flatten())
    }

    /// Drain the remaining records.
    ///
    /// # Errors
    ///
    /// A listener error or the stream's read error.
    pub async fn to_array(&mut self) -> Result<Vec<Value>> {
        let emit = self.emit(CursorOp::ToArray, self.parent);
        let Self {
            source,
            store,
            orchestrator,
            this_arg,
            stream,
            closed,
            ..
        } = self;
        let emitted = orchestrator
            .try_catch_emit(
                &emit,
                Value::Null,
                |id, _| HookPayload::new(id, this_arg.as_str()),
                |_, _| async move {
                    let mut documents = Vec::new();
                    if *closed {
                        return Ok(documents);
                    }
                    let stream = stream.get_or_insert_with(|| Self::open(source, store));
                    while let Some(document) = stream.next().await {
                        documents.push(document?);
                    }
                    Ok(documents)
                },
            )
            .await?;
        Ok(emitted.completed().unwrap_or_default())
    }

    /// Visit remaining records until `visit` returns `false`.
    ///
    /// Each record is pulled through a nested `next` invocation whose parent
    /// is the `forEach` invocation.
    ///
    /// # Errors
    ///
    /// A listener error or the stream's read error.
    pub async fn for_each<F>(&mut self, visit: F) -> Result<()>
    where
        F: FnMut(Value) -> bool,
    {
        let emit = self.emit(CursorOp::ForEach, self.parent);
        let orchestrator = self.orchestrator.clone();
        let this_arg = self.this_arg.clone();
        orchestrator
            .try_catch_emit(
                &emit,
                Value::Null,
                |id, _| HookPayload::new(id, this_arg),
                |_, invocation| async move {
                    let mut visit = visit;
                    while let Some(document) = self.next_within(Some(invocation)).await? {
                        if !visit(document) {
                            break;
                        }
                    }
                    Ok(())
                },
            )
            .await?;
        Ok(())
    }

    /// Number of records matched by a `find` cursor's filter.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unsupported`] for aggregate cursors, or a listener or
    /// store error.
    pub async fn count(&self) -> Result<u64> {
        let emit = self.emit(CursorOp::Count, self.parent);
        let emitted = self
            .orchestrator
            .try_catch_emit(
                &emit,
                Value::Null,
                |id, _| HookPayload::new(id, self.this_arg.as_str()),
                |_, _| async move {
                    match &self.source {
                        CursorSource::Find { filter, .. } => Ok(self.store.count_documents(filter.clone()).await?),
                        CursorSource::Aggregate { .. } => {
                            Err(StoreError::Unsupported("count on an aggregate cursor".to_string()).into())
                        },
                        CursorSource::Empty => Ok(0),
                    }
                },
            )
            .await?;
        Ok(emitted.completed().unwrap_or_default())
    }

    /// Start over from the first record. Never suspends.
    ///
    /// # Errors
    ///
    /// [`HookError::SyncChainViolation`](collection_hooks_core::HookError::SyncChainViolation)
    /// if an asynchronous listener is registered for `rewind`, or a listener error.
    pub fn rewind(&mut self) -> Result<()> {
        let emit = self.emit(CursorOp::Rewind, self.parent);
        let orchestrator = self.orchestrator.clone();
        let this_arg = self.this_arg.clone();
        orchestrator.try_catch_emit_sync(
            &emit,
            Value::Null,
            |id, _| HookPayload::new(id, this_arg),
            |_, _| {
                self.stream = None;
                Ok(())
            },
        )?;
        Ok(())
    }

    /// Release the underlying stream. Later reads return nothing.
    ///
    /// # Errors
    ///
    /// A listener error.
    pub async fn close(&mut self) -> Result<()> {
        let emit = self.emit(CursorOp::Close, self.parent);
        let Self {
            orchestrator,
            this_arg,
            stream,
            closed,
            ..
        } = self;
        orchestrator
            .try_catch_emit(
                &emit,
                Value::Null,
                |id, _| HookPayload::new(id, this_arg.as_str()),
                |_, _| async move {
                    *stream = None;
                    *closed = true;
                    Ok(())
                },
            )
            .await?;
        Ok(())
    }
}

impl fmt::Debug for HookedCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookedCursor")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("parent", &self.parent)
            .field("open", &self.stream.is_some())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
