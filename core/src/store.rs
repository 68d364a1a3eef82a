//! The underlying document store.
//!
//! [`DocumentStore`] is the only collaborator a hooked collection talks to.
//! It needs four capabilities: point fetch by filter and projection, point and
//! bulk writes, sequence iteration, and counting. Everything else (query
//! planning, storage, wire protocol) is the implementation's business.
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
//! store can be held as `Arc<dyn DocumentStore>`.

use futures::Stream;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

use crate::args::{FindOneAndOptions, FindOptions, UpdateOptions};
use crate::error::StoreError;
use crate::results::{DeleteResult, InsertManyResult, InsertOneResult, UpdateResult};

/// Boxed future returned by store calls.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// A lazily evaluated sequence of records.
///
/// Nothing is read from the store until the stream is first polled.
pub type DocumentStream = Pin<Box<dyn Stream<Item = Result<Value, StoreError>> + Send>>;

/// A record-oriented data store.
///
/// Filters, mutators and pipelines are opaque JSON values passed through
/// untouched; only `_id` equality and `{"_id": {"$in": [...]}}` filters are
/// produced by the hooks layer itself.
pub trait DocumentStore: Send + Sync {
    /// Name of the collection, exposed to listeners as `thisArg`.
    fn namespace(&self) -> &str;

    /// First record matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::QueryFailed`] when the query cannot run.
    fn find_one(&self, filter: Value, options: FindOptions) -> StoreFuture<'_, Option<Value>>;

    /// All records matching `filter`.
    fn find(&self, filter: Value, options: FindOptions) -> DocumentStream;

    /// Records produced by `pipeline`.
    fn aggregate(&self, pipeline: Vec<Value>) -> DocumentStream;

    /// Number of records matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::QueryFailed`] when the query cannot run.
    fn count_documents(&self, filter: Value) -> StoreFuture<'_, u64>;

    /// Number of records in the collection, possibly from metadata.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::QueryFailed`] when the count is unavailable.
    fn estimated_document_count(&self) -> StoreFuture<'_, u64>;

    /// Distinct values of `key` among records matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::QueryFailed`] when the query cannot run.
    fn distinct(&self, key: String, filter: Value) -> StoreFuture<'_, Vec<Value>>;

    /// Insert one record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriteFailed`] when the write is rejected.
    fn insert_one(&self, document: Value) -> StoreFuture<'_, InsertOneResult>;

    /// Insert several records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriteFailed`] when the write is rejected.
    fn insert_many(&self, documents: Vec<Value>, ordered: bool) -> StoreFuture<'_, InsertManyResult>;

    /// Update the first record matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriteFailed`] when the write is rejected.
    fn update_one(&self, filter: Value, mutator: Value, options: UpdateOptions) -> StoreFuture<'_, UpdateResult>;

    /// Update every record matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriteFailed`] when the write is rejected.
    fn update_many(&self, filter: Value, mutator: Value, options: UpdateOptions) -> StoreFuture<'_, UpdateResult>;

    /// Replace the first record matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriteFailed`] when the write is rejected.
    fn replace_one(
        &self,
        filter: Value,
        replacement: Value,
        options: UpdateOptions,
    ) -> StoreFuture<'_, UpdateResult>;

    /// Delete the first record matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriteFailed`] when the write is rejected.
    fn delete_one(&self, filter: Value) -> StoreFuture<'_, DeleteResult>;

    /// Delete every record matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriteFailed`] when the write is rejected.
    fn delete_many(&self, filter: Value) -> StoreFuture<'_, DeleteResult>;

    /// Update one record and return it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriteFailed`] when the write is rejected.
    fn find_one_and_update(
        &self,
        filter: Value,
        mutator: Value,
        options: FindOneAndOptions,
    ) -> StoreFuture<'_, Option<Value>>;

    /// Replace one record and return it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriteFailed`] when the write is rejected.
    fn find_one_and_replace(
        &self,
        filter: Value,
        replacement: Value,
        options: FindOneAndOptions,
    ) -> StoreFuture<'_, Option<Value>>;

    /// Delete one record and return it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriteFailed`] when the write is rejected.
    fn find_one_and_delete(&self, filter: Value, options: FindOneAndOptions) -> StoreFuture<'_, Option<Value>>;
}
