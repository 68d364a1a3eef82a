//! Integration tests for hooked cursors
//!
//! Cursor operations emit both kind-specific events (`find.cursor.next`) and
//! kind-agnostic aliases (`cursor.next`), each linked to the invocation that
//! created the cursor.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use collection_hooks_core::args::FindOptions;
use collection_hooks_core::{HookError, HookOutcome, StoreError, json};
use collection_hooks_runtime::{CallOptions, HookedCollection, Listener};
use collection_hooks_testing::{InMemoryStore, Recorder, init_tracing};
use std::sync::Arc;

// ============================================================================
// Test Fixtures
// ============================================================================

fn tasks() -> HookedCollection {
    init_tracing();
    let store = InMemoryStore::with_documents(
        "tasks",
        [
            json!({"_id": 1, "done": false}),
            json!({"_id": 2, "done": true}),
            json!({"_id": 3, "done": false}),
        ],
    );
    HookedCollection::new(Arc::new(store))
}

fn call() -> CallOptions {
    CallOptions::default()
}

// ============================================================================
// Reading
// ============================================================================

#[tokio::test]
async fn test_to_array_is_linked_to_find() {
    let tasks = tasks();
    let find = Recorder::new();
    let to_array = Recorder::new();
    tasks.on("before.find", find.listener()).unwrap();
    tasks.on("after.find.cursor.toArray", to_array.listener()).unwrap();

    let mut cursor = tasks.find(json!({"done": false}), FindOptions::default(), &call()).await.unwrap();
    let documents = cursor.to_array().await.unwrap();

    assert_eq!(documents.len(), 2);
    let find_invocation = find.last().unwrap().invocation_symbol;
    assert_eq!(cursor.parent_invocation(), Some(find_invocation));
    let payload = to_array.last().unwrap();
    assert_eq!(payload.operation, "after.find.cursor.toArray.success");
    assert_eq!(payload.parent_invocation_symbol, Some(find_invocation));
    assert_eq!(payload.caller.as_deref(), Some("find"));
    assert_eq!(payload.result, Some(json!(documents)));
}

#[tokio::test]
async fn test_next_fires_alias_and_specific_events() {
    let tasks = tasks();
    let alias = Recorder::new();
    let specific = Recorder::new();
    tasks.on("before.cursor.next", alias.listener()).unwrap();
    tasks.on("before.find.cursor.next", specific.listener()).unwrap();

    let mut cursor = tasks.find(json!({}), FindOptions::default(), &call()).await.unwrap();
    let first = cursor.next().await.unwrap();

    assert_eq!(first, Some(json!({"_id": 1, "done": false})));
    assert_eq!(alias.len(), 1);
    assert_eq!(specific.len(), 1);
    assert_eq!(alias.last().unwrap().invocation_symbol, specific.last().unwrap().invocation_symbol);
}

#[tokio::test]
async fn test_after_next_can_rewrite_record() {
    let tasks = tasks();
    tasks
        .on(
            "after.cursor.next",
            Listener::sync(|payload| match payload.result.clone() {
                Some(mut document) if document.is_object() => {
                    document["seen"] = json!(true);
                    Ok(HookOutcome::Replace(document))
                },
                _ => Ok(HookOutcome::Continue),
            }),
        )
        .unwrap();

    let mut cursor = tasks.find(json!({"_id": 2}), FindOptions::default(), &call()).await.unwrap();

    assert_eq!(cursor.next().await.unwrap(), Some(json!({"_id": 2, "done": true, "seen": true})));
    assert_eq!(cursor.next().await.unwrap(), None);
}

#[tokio::test]
async fn test_skipped_next_returns_none_without_advancing() {
    let tasks = tasks();
    let id = tasks.on("before.cursor.next", Listener::sync(|_| Ok(HookOutcome::Skip))).unwrap();

    let mut cursor = tasks.find(json!({}), FindOptions::default(), &call()).await.unwrap();
    assert_eq!(cursor.next().await.unwrap(), None);

    tasks.off("before.cursor.next", id).unwrap();
    assert_eq!(cursor.next().await.unwrap().unwrap()["_id"], json!(1));
}

#[tokio::test]
async fn test_for_each_nests_next_under_for_each() {
    let tasks = tasks();
    let for_each = Recorder::new();
    let next = Recorder::new();
    tasks.on("before.cursor.forEach", for_each.listener()).unwrap();
    tasks.on("before.cursor.next", next.listener()).unwrap();

    let mut cursor = tasks.find(json!({}), FindOptions::default(), &call()).await.unwrap();
    let mut visited = Vec::new();
    cursor
        .for_each(|document| {
            visited.push(document["_id"].clone());
            true
        })
        .await
        .unwrap();

    assert_eq!(visited, [json!(1), json!(2), json!(3)]);
    let parent = for_each.last().unwrap().invocation_symbol;
    assert_eq!(next.len(), 4);
    assert!(next.payloads().iter().all(|payload| payload.parent_invocation_symbol == Some(parent)));
}

#[tokio::test]
async fn test_for_each_stops_when_visitor_declines() {
    let tasks = tasks();
    let mut cursor = tasks.find(json!({}), FindOptions::default(), &call()).await.unwrap();
    let mut visited = 0;

    cursor
        .for_each(|_| {
            visited += 1;
            false
        })
        .await
        .unwrap();

    assert_eq!(visited, 1);
    assert_eq!(cursor.to_array().await.unwrap().len(), 2);
}

// ============================================================================
// Rewind / Close / Count
// ============================================================================

#[tokio::test]
async fn test_rewind_restarts_iteration() {
    let tasks = tasks();
    let rewinds = Recorder::new();
    tasks.on("before.cursor.rewind", rewinds.listener()).unwrap();

    let mut cursor = tasks.find(json!({}), FindOptions::default(), &call()).await.unwrap();
    assert_eq!(cursor.to_array().await.unwrap().len(), 3);
    cursor.rewind().unwrap();

    assert_eq!(cursor.to_array().await.unwrap().len(), 3);
    assert_eq!(rewinds.events(), ["before.find.cursor.rewind"]);
}

#[tokio::test]
async fn test_rewind_rejects_async_listeners() {
    let tasks = tasks();
    let recorder = Recorder::new();
    tasks.on("before.cursor.rewind", recorder.async_listener()).unwrap();

    let mut cursor = tasks.find(json!({}), FindOptions::default(), &call()).await.unwrap();
    let err = cursor.rewind().unwrap_err();

    assert!(matches!(err, HookError::SyncChainViolation { .. }));
    assert!(recorder.is_empty());
}

#[tokio::test]
async fn test_closed_cursor_yields_nothing() {
    let tasks = tasks();
    let mut cursor = tasks.find(json!({}), FindOptions::default(), &call()).await.unwrap();
    assert!(cursor.next().await.unwrap().is_some());

    cursor.close().await.unwrap();

    assert!(cursor.is_closed());
    assert_eq!(cursor.next().await.unwrap(), None);
    assert!(cursor.to_array().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_count_uses_find_filter() {
    let tasks = tasks();
    let cursor = tasks.find(json!({"done": true}), FindOptions::default(), &call()).await.unwrap();

    assert_eq!(cursor.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_aggregate_cursor_count_is_unsupported() {
    let tasks = tasks();
    let cursor = tasks.aggregate(vec![json!({"$match": {"done": false}})], &call()).await.unwrap();

    let err = cursor.count().await.unwrap_err();

    assert!(matches!(err, HookError::Store(StoreError::Unsupported(_))));
}

#[tokio::test]
async fn test_aggregate_cursor_events_use_aggregate_prefix() {
    let tasks = tasks();
    let recorder = Recorder::new();
    tasks.on("before.cursor.toArray", recorder.listener()).unwrap();

    let mut cursor = tasks
        .aggregate(vec![json!({"$sort": {"_id": -1}}), json!({"$limit": 2})], &call())
        .await
        .unwrap();
    let documents = cursor.to_array().await.unwrap();

    assert_eq!(documents[0]["_id"], json!(3));
    assert_eq!(recorder.events(), ["before.aggregate.cursor.toArray"]);
    assert_eq!(recorder.last().unwrap().caller.as_deref(), Some("aggregate"));
}

// ============================================================================
// Skipped Creation
// ============================================================================

#[tokio::test]
async fn test_skipped_find_returns_empty_cursor() {
    let tasks = tasks();
    tasks.on("before.find", Listener::sync(|_| Ok(HookOutcome::Skip))).unwrap();

    let mut cursor = tasks.find(json!({}), FindOptions::default(), &call()).await.unwrap();

    assert_eq!(cursor.parent_invocation(), None);
    assert!(cursor.to_array().await.unwrap().is_empty());
    assert_eq!(cursor.count().await.unwrap(), 0);
}
