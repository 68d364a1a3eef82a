//! In-memory document store
//!
//! [`InMemoryStore`] implements [`DocumentStore`] over a `Vec` of JSON
//! records. It understands enough of the usual query language for tests:
//!
//! - filters: field equality (dotted paths, array membership), `$eq`, `$ne`,
//!   `$in`, `$nin`, `$gt`, `$gte`, `$lt`, `$lte`, `$exists`, `$and`, `$or`
//! - mutators: `$set`, `$unset`, `$inc`
//! - pipelines: `$match`, `$sort`, `$skip`, `$limit`, `$project`
//!
//! Call counters and injectable failures make it easy to assert how often
//! the hooks layer reached the store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use collection_hooks_core::args::{FindOneAndOptions, FindOptions, ReturnDocument, UpdateOptions};
use collection_hooks_core::document::{ID_FIELD, id_of};
use collection_hooks_core::projection::Projection;
use collection_hooks_core::results::{DeleteResult, InsertManyResult, InsertOneResult, UpdateResult};
use collection_hooks_core::store::{DocumentStore, DocumentStream, StoreFuture};
use collection_hooks_core::{StoreError, Value, json};
use serde_json::Map;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Default)]
struct State {
    documents: Vec<Value>,
    read_failure: Option<String>,
    write_failure: Option<String>,
}

#[derive(Debug, Default)]
struct Calls {
    find_one: AtomicUsize,
    find: AtomicUsize,
    writes: AtomicUsize,
}

/// In-memory document store for fast, deterministic tests.
///
/// Clones share records and counters.
///
/// # Example
///
/// ```
/// use collection_hooks_core::{DocumentStore, json};
/// use collection_hooks_testing::InMemoryStore;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryStore::with_documents("users", [json!({"_id": 1, "name": "ada"})]);
/// let found = store.find_one(json!({"name": "ada"}), Default::default()).await.unwrap();
/// assert_eq!(found, Some(json!({"_id": 1, "name": "ada"})));
/// assert_eq!(store.find_one_calls(), 1);
/// # });
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    namespace: String,
    state: Arc<RwLock<State>>,
    calls: Arc<Calls>,
}

impl InMemoryStore {
    /// Create an empty store named `namespace`
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            state: Arc::new(RwLock::new(State::default())),
            calls: Arc::new(Calls::default()),
        }
    }

    /// Create a store holding `documents`
    ///
    /// Documents without `_id` are stored as is.
    #[must_use]
    pub fn with_documents(namespace: impl Into<String>, documents: impl IntoIterator<Item = Value>) -> Self {
        let store = Self::new(namespace);
        store.state.write().unwrap().documents.extend(documents);
        store
    }

    /// Snapshot of every stored record, in insertion order
    #[must_use]
    pub fn documents(&self) -> Vec<Value> {
        self.state.read().unwrap().documents.clone()
    }

    /// The record whose `_id` is `id`
    #[must_use]
    pub fn get(&self, id: &Value) -> Option<Value> {
        self.state
            .read()
            .unwrap()
            .documents
            .iter()
            .find(|doc| id_of(doc) == Some(id))
            .cloned()
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().unwrap().documents.len()
    }

    /// Whether the store holds no record
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every later read fail with `message`
    pub fn fail_reads(&self, message: impl Into<String>) {
        self.state.write().unwrap().read_failure = Some(message.into());
    }

    /// Make every later write fail with `message`
    pub fn fail_writes(&self, message: impl Into<String>) {
        self.state.write().unwrap().write_failure = Some(message.into());
    }

    /// Clear injected failures
    pub fn heal(&self) {
        let mut state = self.state.write().unwrap();
        state.read_failure = None;
        state.write_failure = None;
    }

    /// Number of `find_one` calls so far
    #[must_use]
    pub fn find_one_calls(&self) -> usize {
        self.calls.find_one.load(Ordering::SeqCst)
    }

    /// Number of `find` streams opened so far
    #[must_use]
    pub fn find_calls(&self) -> usize {
        self.calls.find.load(Ordering::SeqCst)
    }

    /// Number of write calls so far, failed ones included
    #[must_use]
    pub fn write_calls(&self) -> usize {
        self.calls.writes.load(Ordering::SeqCst)
    }

    fn check_reads(&self) -> StoreResult<()> {
        match &self.state.read().unwrap().read_failure {
            Some(message) => Err(StoreError::QueryFailed(message.clone())),
            None => Ok(()),
        }
    }

    fn begin_write(&self) -> StoreResult<RwLockWriteGuard<'_, State>> {
        self.calls.writes.fetch_add(1, Ordering::SeqCst);
        let state = self.state.write().unwrap();
        match &state.write_failure {
            Some(message) => Err(StoreError::WriteFailed(message.clone())),
            None => Ok(state),
        }
    }

    fn select(&self, filter: &Value, options: &FindOptions) -> StoreResult<Vec<Value>> {
        self.check_reads()?;
        let mut documents: Vec<Value> = self
            .state
            .read()
            .unwrap()
            .documents
            .iter()
            .filter(|doc| matches(doc, filter))
            .cloned()
            .collect();
        if let Some(sort) = &options.sort {
            sort_documents(&mut documents, sort);
        }
        let skip = options.skip.map_or(0, to_usize);
        let limit = options.limit.filter(|&limit| limit > 0).map_or(usize::MAX, to_usize);
        Ok(documents
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|doc| project(doc, options.projection.as_ref()))
            .collect())
    }

    fn run_pipeline(&self, pipeline: &[Value]) -> StoreResult<Vec<Value>> {
        self.check_reads()?;
        let mut documents = self.documents();
        for stage in pipeline {
            let Some((name, spec)) = stage.as_object().and_then(|stage| stage.iter().next()) else {
                return Err(StoreError::QueryFailed("empty pipeline stage".to_string()));
            };
            match name.as_str() {
                "$match" => documents.retain(|doc| matches(doc, spec)),
                "$sort" => sort_documents(&mut documents, spec),
                "$skip" => {
                    let count = spec.as_u64().map_or(0, to_usize).min(documents.len());
                    documents.drain(..count);
                },
                "$limit" => documents.truncate(spec.as_u64().map_or(usize::MAX, to_usize)),
                "$project" => {
                    let projection =
                        Projection::try_from(spec).map_err(|err| StoreError::QueryFailed(err.to_string()))?;
                    documents = documents.iter().map(|doc| projection.apply(doc)).collect();
                },
                other => return Err(StoreError::Unsupported(format!("pipeline stage {other}"))),
            }
        }
        Ok(documents)
    }

    fn insert_into(state: &mut State, mut document: Value) -> StoreResult<Value> {
        let id = ensure_id(&mut document)?;
        if state.documents.iter().any(|doc| id_of(doc) == Some(&id)) {
            return Err(StoreError::WriteFailed(format!("duplicate key {id}")));
        }
        state.documents.push(document);
        Ok(id)
    }

    fn update(&self, filter: &Value, mutator: &Value, options: &UpdateOptions, many: bool) -> StoreResult<UpdateResult> {
        let mut state = self.begin_write()?;
        let mut result = UpdateResult {
            acknowledged: true,
            ..UpdateResult::default()
        };
        for doc in state.documents.iter_mut().filter(|doc| matches(doc, filter)) {
            result.matched_count += 1;
            let before = doc.clone();
            apply_mutator(doc, mutator)?;
            if *doc != before {
                result.modified_count += 1;
            }
            if !many {
                break;
            }
        }
        if result.matched_count == 0 && options.upsert {
            let mut doc = upsert_seed(filter);
            apply_mutator(&mut doc, mutator)?;
            result.upserted_id = Some(Self::insert_into(&mut state, doc)?);
        }
        Ok(result)
    }

    fn replace(&self, filter: &Value, replacement: &Value, options: &UpdateOptions) -> StoreResult<UpdateResult> {
        check_replacement(replacement)?;
        let mut state = self.begin_write()?;
        if let Some(doc) = state.documents.iter_mut().find(|doc| matches(doc, filter)) {
            let next = with_kept_id(replacement.clone(), id_of(doc));
            let modified = *doc != next;
            *doc = next;
            return Ok(UpdateResult {
                acknowledged: true,
                matched_count: 1,
                modified_count: u64::from(modified),
                upserted_id: None,
            });
        }
        if !options.upsert {
            return Ok(UpdateResult {
                acknowledged: true,
                ..UpdateResult::default()
            });
        }
        let seed = upsert_seed(filter);
        let doc = with_kept_id(replacement.clone(), id_of(&seed));
        let id = Self::insert_into(&mut state, doc)?;
        Ok(UpdateResult {
            acknowledged: true,
            upserted_id: Some(id),
            ..UpdateResult::default()
        })
    }

    fn delete(&self, filter: &Value, many: bool) -> StoreResult<DeleteResult> {
        let mut state = self.begin_write()?;
        let before = state.documents.len();
        if many {
            state.documents.retain(|doc| !matches(doc, filter));
        } else if let Some(position) = state.documents.iter().position(|doc| matches(doc, filter)) {
            state.documents.remove(position);
        }
        Ok(DeleteResult {
            acknowledged: true,
            deleted_count: (before - state.documents.len()) as u64,
        })
    }

    fn find_and_modify(
        &self,
        filter: &Value,
        change: Change<'_>,
        options: &FindOneAndOptions,
    ) -> StoreResult<Option<Value>> {
        if let Change::Replace(replacement) = change {
            check_replacement(replacement)?;
        }
        let mut state = self.begin_write()?;
        let projection = options.projection.as_ref();
        let Some(index) = first_match(&state.documents, filter, options.sort.as_ref()) else {
            if !options.upsert || matches!(change, Change::Delete) {
                return Ok(None);
            }
            let seed = upsert_seed(filter);
            let doc = match change {
                Change::Update(mutator) => {
                    let mut doc = seed;
                    apply_mutator(&mut doc, mutator)?;
                    doc
                },
                Change::Replace(replacement) => with_kept_id(replacement.clone(), id_of(&seed)),
                Change::Delete => return Ok(None),
            };
            let id = Self::insert_into(&mut state, doc)?;
            return Ok(match options.return_document {
                ReturnDocument::Before => None,
                ReturnDocument::After => state
                    .documents
                    .iter()
                    .find(|doc| id_of(doc) == Some(&id))
                    .map(|doc| project(doc.clone(), projection)),
            });
        };

        let before = state.documents[index].clone();
        let after = match change {
            Change::Update(mutator) => {
                apply_mutator(&mut state.documents[index], mutator)?;
                Some(state.documents[index].clone())
            },
            Change::Replace(replacement) => {
                let next = with_kept_id(replacement.clone(), id_of(&before));
                state.documents[index] = next.clone();
                Some(next)
            },
            Change::Delete => {
                state.documents.remove(index);
                None
            },
        };
        let returned = match options.return_document {
            ReturnDocument::Before => Some(before),
            ReturnDocument::After => after,
        };
        Ok(returned.map(|doc| project(doc, projection)))
    }
}

#[derive(Clone, Copy)]
enum Change<'a> {
    Update(&'a Value),
    Replace(&'a Value),
    Delete,
}

impl DocumentStore for InMemoryStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn find_one(&self, filter: Value, options: FindOptions) -> StoreFuture<'_, Option<Value>> {
        self.calls.find_one.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let found = self.select(&filter, &options.with_limit(1))?;
            Ok(found.into_iter().next())
        })
    }

    fn find(&self, filter: Value, options: FindOptions) -> DocumentStream {
        let store = self.clone();
        Box::pin(async_stream::stream! {
            store.calls.find.fetch_add(1, Ordering::SeqCst);
            match store.select(&filter, &options) {
                Ok(documents) => {
                    for document in documents {
                        yield Ok(document);
                    }
                },
                Err(err) => yield Err(err),
            }
        })
    }

    fn aggregate(&self, pipeline: Vec<Value>) -> DocumentStream {
        let store = self.clone();
        Box::pin(async_stream::stream! {
            match store.run_pipeline(&pipeline) {
                Ok(documents) => {
                    for document in documents {
                        yield Ok(document);
                    }
                },
                Err(err) => yield Err(err),
            }
        })
    }

    fn count_documents(&self, filter: Value) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let matched = self.select(&filter, &FindOptions::default())?;
            Ok(matched.len() as u64)
        })
    }

    fn estimated_document_count(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            self.check_reads()?;
            Ok(self.len() as u64)
        })
    }

    fn distinct(&self, key: String, filter: Value) -> StoreFuture<'_, Vec<Value>> {
        Box::pin(async move {
            let mut values: Vec<Value> = Vec::new();
            for doc in self.select(&filter, &FindOptions::default())? {
                if let Some(value) = lookup(&doc, &key).filter(|value| !values.contains(value)) {
                    values.push(value.clone());
                }
            }
            Ok(values)
        })
    }

    fn insert_one(&self, document: Value) -> StoreFuture<'_, InsertOneResult> {
        Box::pin(async move {
            let mut state = self.begin_write()?;
            let inserted_id = Self::insert_into(&mut state, document)?;
            Ok(InsertOneResult {
                acknowledged: true,
                inserted_id,
            })
        })
    }

    fn insert_many(&self, documents: Vec<Value>, ordered: bool) -> StoreFuture<'_, InsertManyResult> {
        Box::pin(async move {
            let mut state = self.begin_write()?;
            let mut inserted_ids = BTreeMap::new();
            let mut first_error = None;
            for (index, document) in documents.into_iter().enumerate() {
                match Self::insert_into(&mut state, document) {
                    Ok(id) => {
                        inserted_ids.insert(index, id);
                    },
                    Err(err) if ordered => return Err(err),
                    Err(err) => {
                        first_error.get_or_insert(err);
                    },
                }
            }
            match first_error {
                Some(err) => Err(err),
                None => Ok(InsertManyResult {
                    acknowledged: true,
                    inserted_ids,
                }),
            }
        })
    }

    fn update_one(&self, filter: Value, mutator: Value, options: UpdateOptions) -> StoreFuture<'_, UpdateResult> {
        Box::pin(async move { self.update(&filter, &mutator, &options, false) })
    }

    fn update_many(&self, filter: Value, mutator: Value, options: UpdateOptions) -> StoreFuture<'_, UpdateResult> {
        Box::pin(async move { self.update(&filter, &mutator, &options, true) })
    }

    fn replace_one(
        &self,
        filter: Value,
        replacement: Value,
        options: UpdateOptions,
    ) -> StoreFuture<'_, UpdateResult> {
        Box::pin(async move { self.replace(&filter, &replacement, &options) })
    }

    fn delete_one(&self, filter: Value) -> StoreFuture<'_, DeleteResult> {
        Box::pin(async move { self.delete(&filter, false) })
    }

    fn delete_many(&self, filter: Value) -> StoreFuture<'_, DeleteResult> {
        Box::pin(async move { self.delete(&filter, true) })
    }

    fn find_one_and_update(
        &self,
        filter: Value,
        mutator: Value,
        options: FindOneAndOptions,
    ) -> StoreFuture<'_, Option<Value>> {
        Box::pin(async move { self.find_and_modify(&filter, Change::Update(&mutator), &options) })
    }

    fn find_one_and_replace(
        &self,
        filter: Value,
        replacement: Value,
        options: FindOneAndOptions,
    ) -> StoreFuture<'_, Option<Value>> {
        Box::pin(async move { self.find_and_modify(&filter, Change::Replace(&replacement), &options) })
    }

    fn find_one_and_delete(&self, filter: Value, options: FindOneAndOptions) -> StoreFuture<'_, Option<Value>> {
        Box::pin(async move { self.find_and_modify(&filter, Change::Delete, &options) })
    }
}

fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

fn project(doc: Value, projection: Option<&Projection>) -> Value {
    match projection {
        Some(projection) => projection.apply(&doc),
        None => doc,
    }
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, segment| value.get(segment))
}

fn lookup_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(doc, |value, segment| value.get_mut(segment))
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn unset_path(doc: &mut Value, path: &str) {
    let (parent, key) = match path.rsplit_once('.') {
        Some((parent, key)) => (lookup_mut(doc, parent), key),
        None => (Some(doc), path),
    };
    if let Some(Value::Object(map)) = parent {
        map.remove(key);
    }
}

fn is_operator_object(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| !map.is_empty() && map.keys().all(|key| key.starts_with('$')))
}

fn each(value: &Value) -> impl Iterator<Item = &Value> {
    value.as_array().into_iter().flatten()
}

fn matches(doc: &Value, filter: &Value) -> bool {
    let Value::Object(conditions) = filter else {
        return filter.is_null();
    };
    conditions.iter().all(|(key, condition)| match key.as_str() {
        "$and" => each(condition).all(|sub| matches(doc, sub)),
        "$or" => each(condition).any(|sub| matches(doc, sub)),
        _ => matches_condition(lookup(doc, key), condition),
    })
}

fn matches_condition(value: Option<&Value>, condition: &Value) -> bool {
    if !is_operator_object(condition) {
        return match value {
            Some(Value::Array(items)) => items.contains(condition) || value == Some(condition),
            Some(value) => value == condition,
            None => condition.is_null(),
        };
    }
    let Value::Object(operators) = condition else {
        return false;
    };
    operators.iter().all(|(operator, operand)| match operator.as_str() {
        "$eq" => value == Some(operand),
        "$ne" => value != Some(operand),
        "$in" => value.is_some_and(|value| each(operand).any(|candidate| candidate == value)),
        "$nin" => !value.is_some_and(|value| each(operand).any(|candidate| candidate == value)),
        "$gt" => compare_to(value, operand) == Some(CmpOrdering::Greater),
        "$gte" => matches!(compare_to(value, operand), Some(CmpOrdering::Greater | CmpOrdering::Equal)),
        "$lt" => compare_to(value, operand) == Some(CmpOrdering::Less),
        "$lte" => matches!(compare_to(value, operand), Some(CmpOrdering::Less | CmpOrdering::Equal)),
        "$exists" => value.is_some() == operand.as_bool().unwrap_or(true),
        _ => false,
    })
}

fn compare_to(value: Option<&Value>, operand: &Value) -> Option<CmpOrdering> {
    compare(value?, operand)
}

fn compare(left: &Value, right: &Value) -> Option<CmpOrdering> {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => left.as_f64()?.partial_cmp(&right.as_f64()?),
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        (Value::Null, Value::Null) => Some(CmpOrdering::Equal),
        _ => None,
    }
}

fn sort_documents(documents: &mut [Value], sort: &Value) {
    let Some(keys) = sort.as_object() else {
        return;
    };
    documents.sort_by(|left, right| {
        for (path, direction) in keys {
            let ordering = match (lookup(left, path), lookup(right, path)) {
                (Some(left), Some(right)) => compare(left, right).unwrap_or(CmpOrdering::Equal),
                (None, Some(_)) => CmpOrdering::Less,
                (Some(_), None) => CmpOrdering::Greater,
                (None, None) => CmpOrdering::Equal,
            };
            let ordering = if direction.as_i64() == Some(-1) { ordering.reverse() } else { ordering };
            if ordering != CmpOrdering::Equal {
                return ordering;
            }
        }
        CmpOrdering::Equal
    });
}

fn first_match(documents: &[Value], filter: &Value, sort: Option<&Value>) -> Option<usize> {
    let candidates: Vec<usize> = (0..documents.len())
        .filter(|&index| matches(&documents[index], filter))
        .collect();
    let Some(sort) = sort else {
        return candidates.first().copied();
    };
    let mut ordered: Vec<Value> = candidates.iter().map(|&index| documents[index].clone()).collect();
    sort_documents(&mut ordered, sort);
    let first = ordered.first()?;
    candidates.into_iter().find(|&index| &documents[index] == first)
}

fn apply_mutator(doc: &mut Value, mutator: &Value) -> StoreResult<()> {
    let Value::Object(operations) = mutator else {
        return Err(StoreError::WriteFailed("mutator must be an object".to_string()));
    };
    if !is_operator_object(mutator) {
        return Err(StoreError::WriteFailed("mutator must only contain update operators".to_string()));
    }
    for (operation, fields) in operations {
        let Value::Object(fields) = fields else {
            return Err(StoreError::WriteFailed(format!("{operation} expects an object")));
        };
        for (path, value) in fields {
            match operation.as_str() {
                "$set" => set_path(doc, path, value.clone()),
                "$unset" => unset_path(doc, path),
                "$inc" => {
                    let current = lookup(doc, path).cloned().unwrap_or(json!(0));
                    let next = match (current.as_i64(), value.as_i64()) {
                        (Some(current), Some(step)) => json!(current.saturating_add(step)),
                        _ => json!(current.as_f64().unwrap_or(0.0) + value.as_f64().unwrap_or(0.0)),
                    };
                    set_path(doc, path, next);
                },
                other => return Err(StoreError::Unsupported(format!("update operator {other}"))),
            }
        }
    }
    Ok(())
}

fn check_replacement(replacement: &Value) -> StoreResult<()> {
    match replacement.as_object() {
        Some(map) if map.keys().any(|key| key.starts_with('$')) => Err(StoreError::WriteFailed(
            "replacement must not contain update operators".to_string(),
        )),
        Some(_) => Ok(()),
        None => Err(StoreError::WriteFailed("replacement must be an object".to_string())),
    }
}

fn with_kept_id(mut replacement: Value, id: Option<&Value>) -> Value {
    if let (Some(id), Value::Object(map)) = (id, &mut replacement) {
        map.insert(ID_FIELD.to_string(), id.clone());
    }
    replacement
}

/// Equality constraints of `filter`, as the starting point of an upserted record.
fn upsert_seed(filter: &Value) -> Value {
    let mut seed = Value::Object(Map::new());
    if let Value::Object(conditions) = filter {
        for (key, condition) in conditions {
            if !key.starts_with('$') && !is_operator_object(condition) {
                set_path(&mut seed, key, condition.clone());
            }
        }
    }
    seed
}

fn ensure_id(document: &mut Value) -> StoreResult<Value> {
    let Value::Object(map) = document else {
        return Err(StoreError::WriteFailed("document must be an object".to_string()));
    };
    let id = map
        .entry(ID_FIELD.to_string())
        .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
    Ok(id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryStore {
        InMemoryStore::with_documents(
            "items",
            [
                json!({"_id": 1, "kind": "a", "n": 3, "tags": ["x"]}),
                json!({"_id": 2, "kind": "b", "n": 1}),
                json!({"_id": 3, "kind": "a", "n": 2, "meta": {"flag": true}}),
            ],
        )
    }

    #[tokio::test]
    async fn test_filters() {
        let store = store();
        let count = |filter: Value| {
            let store = store.clone();
            async move { store.count_documents(filter).await.unwrap() }
        };
        assert_eq!(count(json!({"kind": "a"})).await, 2);
        assert_eq!(count(json!({"tags": "x"})).await, 1);
        assert_eq!(count(json!({"n": {"$gte": 2}})).await, 2);
        assert_eq!(count(json!({"_id": {"$in": [1, 2]}})).await, 2);
        assert_eq!(count(json!({"meta.flag": true})).await, 1);
        assert_eq!(count(json!({"$or": [{"kind": "b"}, {"n": 2}]})).await, 2);
        assert_eq!(count(json!({"meta": {"$exists": false}})).await, 2);
    }

    #[tokio::test]
    async fn test_update_operators() {
        let store = store();
        let result = store
            .update_many(
                json!({"kind": "a"}),
                json!({"$inc": {"n": 10}, "$set": {"seen.at": "now"}, "$unset": {"tags": 1}}),
                UpdateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.modified_count, 2);
        assert_eq!(store.get(&json!(1)), Some(json!({"_id": 1, "kind": "a", "n": 13, "seen": {"at": "now"}})));
    }

    #[tokio::test]
    async fn test_upsert_uses_filter_equalities() {
        let store = InMemoryStore::new("items");
        let result = store
            .update_one(json!({"_id": 9, "n": {"$gt": 1}}), json!({"$set": {"kind": "z"}}), UpdateOptions { upsert: true })
            .await
            .unwrap();
        assert_eq!(result.upserted_id, Some(json!(9)));
        assert_eq!(store.documents(), [json!({"_id": 9, "kind": "z"})]);
    }

    #[tokio::test]
    async fn test_find_is_lazy_and_sorted() {
        use futures::TryStreamExt;

        let store = store();
        let stream = store.find(json!({}), FindOptions {
            sort: Some(json!({"n": 1})),
            ..FindOptions::default()
        });
        assert_eq!(store.find_calls(), 0);
        let ids: Vec<Value> = stream.map_ok(|doc| doc["_id"].clone()).try_collect().await.unwrap();
        assert_eq!(ids, [json!(2), json!(3), json!(1)]);
        assert_eq!(store.find_calls(), 1);
    }

    #[tokio::test]
    async fn test_find_one_and_update_returns_requested_version() {
        let store = store();
        let after = store
            .find_one_and_update(
                json!({"_id": 2}),
                json!({"$set": {"n": 5}}),
                FindOneAndOptions {
                    return_document: ReturnDocument::After,
                    ..FindOneAndOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(after, Some(json!({"_id": 2, "kind": "b", "n": 5})));
    }

    #[tokio::test]
    async fn test_pipeline() {
        use futures::TryStreamExt;

        let store = store();
        let out: Vec<Value> = store
            .aggregate(vec![
                json!({"$match": {"kind": "a"}}),
                json!({"$sort": {"n": -1}}),
                json!({"$limit": 1}),
                json!({"$project": {"n": 1, "_id": 0}}),
            ])
            .try_collect()
            .await
            .unwrap();
        assert_eq!(out, [json!({"n": 3})]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = store();
        store.fail_writes("read only");
        let err = store.delete_many(json!({})).await.unwrap_err();
        assert_eq!(err, StoreError::WriteFailed("read only".into()));
        assert_eq!(store.write_calls(), 1);

        store.heal();
        store.fail_reads("offline");
        assert!(store.find_one(json!({}), FindOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_rejected() {
        let store = store();
        let err = store.insert_one(json!({"_id": 1})).await.unwrap_err();
        assert!(matches!(err, StoreError::WriteFailed(_)));

        let generated = store.insert_one(json!({"kind": "c"})).await.unwrap();
        assert!(generated.inserted_id.is_string());
    }
}
