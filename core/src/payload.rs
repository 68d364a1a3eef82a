//! What a listener sees and what it may return.
//!
//! Every listener receives a [`HookPayload`]. Which fields are set depends on
//! the event:
//!
//! | Field | Set for |
//! |---|---|
//! | `args` / `argsOrig` | every public operation |
//! | `doc` / `docOrig` | per-record `insert` |
//! | `filter`, `mutator`, `replacement` | updates and replaces |
//! | `_id` | per-record `update`/`delete` |
//! | `_ids` | `deleteMany` |
//! | `previousDocument` | after-listeners that asked for it |
//! | `result` / `resultOrig` | after-success |
//! | `error` | after-error |
//!
//! `invocationSymbol`, `parentInvocationSymbol`, `caller`, `thisArg` and
//! `operation` are always present (the parent and caller only for nested
//! invocations).

use futures::future::BoxFuture;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::{HookError, Result};
use crate::invocation::InvocationId;

/// What a listener wants done with the value it was handed.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum HookOutcome {
    /// Keep the running value unchanged
    #[default]
    Continue,
    /// Replace the running value for the next listener and the operation
    Replace(Value),
    /// Veto the invocation: the operation and its after-phase do not run.
    ///
    /// Only meaningful for before-listeners; after-listeners returning it are
    /// treated as [`HookOutcome::Continue`].
    Skip,
}

/// The payload slot a chained invocation threads through its listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainKey {
    /// `args` / `argsOrig`
    Args,
    /// `doc` / `docOrig`
    Doc,
    /// `result` / `resultOrig`
    Result,
}

impl ChainKey {
    /// Payload field name of the running value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Args => "args",
            Self::Doc => "doc",
            Self::Result => "result",
        }
    }
}

/// Lazy access to the record an invocation is about.
///
/// Implemented by the per-invocation document cache. Every call for the same
/// id within one invocation resolves to the same single fetch.
pub trait DocumentLookup: Send + Sync {
    /// Current version of the record `id`, or `None` if it does not exist or
    /// no listener asked for it.
    fn get_document(&self, id: &Value) -> BoxFuture<'static, Result<Option<Value>>>;
}

/// The data handed to every listener.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookPayload {
    /// Full event string of the phase being dispatched, e.g. `before.insertOne`
    pub operation: String,
    /// Identity of this invocation; identical in every phase
    pub invocation_symbol: InvocationId,
    /// Identity of the invocation that triggered this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_invocation_symbol: Option<InvocationId>,
    /// Public operation that triggered a nested invocation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    /// Namespace of the collection
    pub this_arg: String,
    /// Current arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Arguments as passed by the caller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args_orig: Option<Value>,
    /// Current document of a per-record insert
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
    /// Document of a per-record insert before any listener touched it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_orig: Option<Value>,
    /// Filter of an update, replace or delete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    /// Update operators
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutator: Option<Value>,
    /// Replacement record body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<Value>,
    /// Identifier of the record a per-record event is about
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Identifiers of every record a multi-record delete matched
    #[serde(rename = "_ids", skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<Value>>,
    /// The record as it was before the operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_document: Option<Value>,
    /// Current result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Result as returned by the operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_orig: Option<Value>,
    /// Failure of the operation
    #[serde(serialize_with = "serialize_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<HookError>,
    #[serde(skip)]
    documents: Option<Arc<dyn DocumentLookup>>,
}

#[allow(clippy::ref_option)]
fn serialize_error<S: Serializer>(error: &Option<HookError>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_str(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

impl HookPayload {
    /// Empty payload for one invocation of a collection named `this_arg`.
    pub fn new(invocation_symbol: InvocationId, this_arg: impl Into<String>) -> Self {
        Self {
            operation: String::new(),
            invocation_symbol,
            parent_invocation_symbol: None,
            caller: None,
            this_arg: this_arg.into(),
            args: None,
            args_orig: None,
            doc: None,
            doc_orig: None,
            filter: None,
            mutator: None,
            replacement: None,
            id: None,
            ids: None,
            previous_document: None,
            result: None,
            result_orig: None,
            error: None,
            documents: None,
        }
    }

    /// Attach the document lookup behind [`HookPayload::get_document`].
    #[must_use]
    pub fn with_documents(mut self, documents: Arc<dyn DocumentLookup>) -> Self {
        self.documents = Some(documents);
        self
    }

    /// The document lookup, if one is attached.
    #[must_use]
    pub fn documents(&self) -> Option<&Arc<dyn DocumentLookup>> {
        self.documents.as_ref()
    }

    /// Running value of `key`.
    #[must_use]
    pub const fn chained(&self, key: ChainKey) -> Option<&Value> {
        match key {
            ChainKey::Args => self.args.as_ref(),
            ChainKey::Doc => self.doc.as_ref(),
            ChainKey::Result => self.result.as_ref(),
        }
    }

    /// Original value of `key`.
    #[must_use]
    pub const fn chained_orig(&self, key: ChainKey) -> Option<&Value> {
        match key {
            ChainKey::Args => self.args_orig.as_ref(),
            ChainKey::Doc => self.doc_orig.as_ref(),
            ChainKey::Result => self.result_orig.as_ref(),
        }
    }

    /// Replace the running value of `key`; the original is left alone.
    pub fn set_chained(&mut self, key: ChainKey, value: Value) {
        *self.slot(key) = Some(value);
    }

    /// Start a chain on `key`: both the running and the original value become `value`.
    pub fn begin_chain(&mut self, key: ChainKey, value: Value) {
        let orig = match key {
            ChainKey::Args => &mut self.args_orig,
            ChainKey::Doc => &mut self.doc_orig,
            ChainKey::Result => &mut self.result_orig,
        };
        *orig = Some(value.clone());
        *self.slot(key) = Some(value);
    }

    fn slot(&mut self, key: ChainKey) -> &mut Option<Value> {
        match key {
            ChainKey::Args => &mut self.args,
            ChainKey::Doc => &mut self.doc,
            ChainKey::Result => &mut self.result,
        }
    }

    /// The current version of the record this invocation is about.
    ///
    /// Resolves to `None` for events without an `_id` or when no listener of
    /// the invocation declared a need for the record.
    ///
    /// # Errors
    ///
    /// Propagates the failure of the underlying fetch, or
    /// [`HookError::Aborted`] when the call was cancelled.
    pub async fn get_document(&self) -> Result<Option<Value>> {
        match &self.id {
            Some(id) => self.get_document_by_id(id).await,
            None => Ok(None),
        }
    }

    /// The current version of record `id` (for `_ids` payloads).
    ///
    /// # Errors
    ///
    /// See [`HookPayload::get_document`].
    pub async fn get_document_by_id(&self, id: &Value) -> Result<Option<Value>> {
        match &self.documents {
            Some(documents) => documents.get_document(id).await,
            None => Ok(None),
        }
    }

    /// The payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`HookError::Serialization`] if a field cannot be encoded.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

impl fmt::Debug for HookPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookPayload")
            .field("operation", &self.operation)
            .field("invocation_symbol", &self.invocation_symbol)
            .field("parent_invocation_symbol", &self.parent_invocation_symbol)
            .field("caller", &self.caller)
            .field("args", &self.args)
            .field("doc", &self.doc)
            .field("id", &self.id)
            .field("result", &self.result)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
