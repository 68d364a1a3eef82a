//! Integration tests for the testing utilities working together

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use collection_hooks_core::args::{FindOptions, UpdateOptions};
use collection_hooks_core::{DocumentStore, HookError, HookOutcome, StoreError, json};
use collection_hooks_runtime::{CallOptions, HookedCollection};
use collection_hooks_testing::{InMemoryStore, Recorder, init_tracing};
use std::sync::Arc;

// ============================================================================
// Recorder
// ============================================================================

#[tokio::test]
async fn test_async_and_sync_recorders_share_one_log() {
    init_tracing();
    let notes = HookedCollection::new(Arc::new(InMemoryStore::new("notes")));
    let recorder = Recorder::new();
    notes.on("before.insertOne", recorder.async_listener()).unwrap();
    notes.on("after.insertOne", recorder.listener()).unwrap();

    notes.insert_one(json!({"_id": "n1"}), &CallOptions::default()).await.unwrap();

    assert_eq!(recorder.events(), ["before.insertOne", "after.insertOne.success"]);
    recorder.clear();
    assert!(recorder.is_empty());
}

#[tokio::test]
async fn test_responding_recorder_can_veto() {
    let store = Arc::new(InMemoryStore::with_documents("notes", [json!({"_id": 1, "pinned": true})]));
    let notes = HookedCollection::new(store.clone());
    let recorder = Recorder::new();
    notes
        .on("before.update", recorder.responding(|_| HookOutcome::Skip))
        .unwrap();

    let result = notes
        .update_one(
            json!({"_id": 1}),
            json!({"$set": {"pinned": false}}),
            UpdateOptions::default(),
            &CallOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.modified_count, 0);
    assert_eq!(recorder.last().unwrap().id, Some(json!(1)));
    assert_eq!(store.get(&json!(1)).unwrap()["pinned"], json!(true));
}

// ============================================================================
// InMemoryStore
// ============================================================================

#[tokio::test]
async fn test_injected_read_failure_reaches_caller() {
    let store = Arc::new(InMemoryStore::with_documents("notes", [json!({"_id": 1})]));
    let notes = HookedCollection::new(store.clone());
    store.fail_reads("replica offline");

    let err = notes
        .find_one(json!({"_id": 1}), FindOptions::default(), &CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HookError::Store(StoreError::QueryFailed(_))));

    store.heal();
    assert_eq!(store.find_one(json!({"_id": 1}), FindOptions::default()).await.unwrap(), Some(json!({"_id": 1})));
}
