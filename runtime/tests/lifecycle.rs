//! Integration tests for the invocation lifecycle of hooked collection calls
//!
//! Covers chain threading through before/after listeners, invocation
//! linkage between public operations and their per-record events, error
//! propagation, wildcard delivery and listener removal.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use collection_hooks_core::args::{InsertManyOptions, UpdateOptions};
use collection_hooks_core::{HookError, HookOutcome, InvocationId, StoreError, json};
use collection_hooks_runtime::{CallOptions, HookedCollection, HooksConfig, Listener};
use collection_hooks_testing::{InMemoryStore, Recorder, init_tracing};
use std::sync::Arc;

// ============================================================================
// Test Fixtures
// ============================================================================

fn collection() -> (Arc<InMemoryStore>, HookedCollection) {
    init_tracing();
    let store = Arc::new(InMemoryStore::new("docs"));
    let hooked = HookedCollection::new(store.clone());
    (store, hooked)
}

fn call() -> CallOptions {
    CallOptions::default()
}

// ============================================================================
// Chains
// ============================================================================

#[tokio::test]
async fn test_before_chain_output_reaches_store_and_after_replacement_reaches_caller() {
    let (store, docs) = collection();
    docs.on(
        "before.insert",
        Listener::sync(|payload| {
            let mut doc = payload.doc.clone().unwrap();
            doc["a"] = json!(1);
            Ok(HookOutcome::Replace(doc))
        }),
    )
    .unwrap();
    let second = Recorder::new();
    docs.on("before.insert", second.listener()).unwrap();
    docs.on(
        "after.insertOne",
        Listener::sync(|payload| {
            let mut result = payload.result.clone().unwrap();
            result["insertedId"] = json!("renamed");
            Ok(HookOutcome::Replace(result))
        }),
    )
    .unwrap();

    let result = docs.insert_one(json!({"_id": 1}), &call()).await.unwrap();

    assert_eq!(result.inserted_id, json!("renamed"));
    assert_eq!(store.get(&json!(1)), Some(json!({"_id": 1, "a": 1})));
    let seen = second.last().unwrap();
    assert_eq!(seen.doc, Some(json!({"_id": 1, "a": 1})));
    assert_eq!(seen.doc_orig, Some(json!({"_id": 1})));
}

#[tokio::test]
async fn test_before_listener_rewrites_public_arguments() {
    let (store, docs) = collection();
    docs.on(
        "before.updateMany",
        Listener::sync(|payload| {
            let mut args = payload.args.clone().unwrap();
            args["filter"] = json!({"tenant": "t1"});
            Ok(HookOutcome::Replace(args))
        }),
    )
    .unwrap();
    docs.insert_many(
        vec![json!({"_id": 1, "tenant": "t1"}), json!({"_id": 2, "tenant": "t2"})],
        InsertManyOptions::default(),
        &call(),
    )
    .await
    .unwrap();

    let result = docs
        .update_many(json!({}), json!({"$set": {"seen": true}}), UpdateOptions::default(), &call())
        .await
        .unwrap();

    assert_eq!(result.modified_count, 1);
    assert_eq!(store.get(&json!(2)), Some(json!({"_id": 2, "tenant": "t2"})));
}

#[tokio::test]
async fn test_skip_on_public_operation_returns_neutral_result() {
    let (store, docs) = collection();
    docs.on("before.deleteMany", Listener::sync(|_| Ok(HookOutcome::Skip))).unwrap();
    let after = Recorder::new();
    docs.on("after.deleteMany", after.listener()).unwrap();
    docs.insert_one(json!({"_id": 1}), &call()).await.unwrap();

    let result = docs.delete_many(json!({}), &call()).await.unwrap();

    assert_eq!(result.deleted_count, 0);
    assert!(!result.acknowledged);
    assert!(after.is_empty());
    assert_eq!(store.len(), 1);
}

// ============================================================================
// Invocation Linkage
// ============================================================================

#[tokio::test]
async fn test_per_record_events_link_to_public_invocation() {
    let (_store, docs) = collection();
    let public = Recorder::new();
    let before = Recorder::new();
    let after = Recorder::new();
    docs.on("before.insertMany", public.listener()).unwrap();
    docs.on("before.insert", before.listener()).unwrap();
    docs.on("after.insert.success", after.listener()).unwrap();

    docs.insert_many(
        vec![json!({"_id": 1}), json!({"_id": 2})],
        InsertManyOptions::default(),
        &call(),
    )
    .await
    .unwrap();

    let parent = public.last().unwrap().invocation_symbol;
    let befores = before.payloads();
    let afters = after.payloads();
    assert_eq!(befores.len(), 2);
    assert_ne!(befores[0].invocation_symbol, befores[1].invocation_symbol);
    for (b, a) in befores.iter().zip(&afters) {
        assert_eq!(b.parent_invocation_symbol, Some(parent));
        assert_eq!(b.caller.as_deref(), Some("insertMany"));
        assert_eq!(b.invocation_symbol, a.invocation_symbol);
        assert_eq!(a.result.as_ref().unwrap()["insertedId"], b.doc.as_ref().unwrap()["_id"]);
    }
}

#[tokio::test]
async fn test_call_options_parent_is_recorded() {
    let (_store, docs) = collection();
    let recorder = Recorder::new();
    docs.on("before.countDocuments", recorder.listener()).unwrap();
    let outer = InvocationId::new();

    docs.count_documents(json!({}), &CallOptions::default().parent(outer)).await.unwrap();

    let payload = recorder.last().unwrap();
    assert_eq!(payload.parent_invocation_symbol, Some(outer));
    assert_eq!(payload.caller, None);
    assert_eq!(payload.this_arg, "docs");
}

#[tokio::test]
async fn test_configured_namespace_is_this_arg() {
    let store = Arc::new(InMemoryStore::new("raw_docs"));
    let docs = HookedCollection::with_config(store, HooksConfig::default().with_namespace("docs"));
    let recorder = Recorder::new();
    docs.on("before.findOne", recorder.listener()).unwrap();

    docs.find_one(json!({}), Default::default(), &call()).await.unwrap();

    assert_eq!(docs.namespace(), "docs");
    assert_eq!(recorder.last().unwrap().this_arg, "docs");
}

// ============================================================================
// Errors
// ============================================================================

#[tokio::test]
async fn test_store_failure_reaches_error_listeners_of_every_level() {
    let (store, docs) = collection();
    store.fail_writes("disk full");
    let record_errors = Recorder::new();
    let public_errors = Recorder::new();
    docs.on("after.insert.error", record_errors.listener()).unwrap();
    docs.on("after.insertOne.error", public_errors.listener()).unwrap();

    let err = docs.insert_one(json!({"_id": 1}), &call()).await.unwrap_err();

    assert!(matches!(err, HookError::Store(StoreError::WriteFailed(ref message)) if message == "disk full"));
    assert_eq!(record_errors.len(), 1);
    assert_eq!(public_errors.len(), 1);
    let seen = public_errors.last().unwrap().error.unwrap();
    assert_eq!(seen.to_string(), err.to_string());
}

#[tokio::test]
async fn test_before_listener_error_skips_operation_but_reaches_error_listeners() {
    let (store, docs) = collection();
    docs.on(
        "before.insertOne",
        Listener::sync(|_| Err(HookError::listener("before.insertOne", "rejected"))),
    )
    .unwrap();
    let errors = Recorder::new();
    docs.on("after.insertOne.error", errors.listener()).unwrap();

    let err = docs.insert_one(json!({"_id": 1}), &call()).await.unwrap_err();

    assert!(err.to_string().contains("rejected"));
    assert_eq!(errors.len(), 1);
    let seen = errors.last().unwrap().error.unwrap();
    assert_eq!(seen.to_string(), err.to_string());
    assert!(store.is_empty());
    assert_eq!(store.write_calls(), 0);
}

#[tokio::test]
async fn test_anyhow_errors_from_listeners_are_attributed() {
    let (_store, docs) = collection();
    docs.on(
        "before.distinct",
        Listener::sync(|_| Err(anyhow::anyhow!("quota exceeded").into())),
    )
    .unwrap();

    let err = docs.distinct("kind", json!({}), &call()).await.unwrap_err();

    match err {
        HookError::Listener { event, message } => {
            assert_eq!(event, "before.distinct");
            assert_eq!(message, "quota exceeded");
        },
        other => panic!("unexpected error: {other}"),
    }
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_wildcard_sees_every_phase() {
    let (_store, docs) = collection();
    let recorder = Recorder::new();
    docs.on("*", recorder.listener()).unwrap();

    docs.estimated_document_count(&call()).await.unwrap();

    assert_eq!(
        recorder.events(),
        ["before.estimatedDocumentCount", "after.estimatedDocumentCount.success"]
    );
}

#[tokio::test]
async fn test_off_removes_listener() {
    let (_store, docs) = collection();
    let recorder = Recorder::new();
    let id = docs.on("before.findOne", recorder.listener()).unwrap();

    assert!(docs.off("before.findOne", id).unwrap());
    assert!(!docs.off("before.findOne", id).unwrap());
    docs.find_one(json!({}), Default::default(), &call()).await.unwrap();

    assert!(recorder.is_empty());
}
