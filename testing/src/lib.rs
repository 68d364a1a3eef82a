//! # Collection Hooks Testing
//!
//! Testing utilities for hooked collections.
//!
//! This crate provides:
//! - [`InMemoryStore`]: a [`DocumentStore`](collection_hooks_core::DocumentStore)
//!   over JSON records, with call counters and injectable failures
//! - [`Recorder`]: listeners that log every payload they receive
//! - [`helpers::init_tracing`]: log output for failing tests
//!
//! ## Example
//!
//! ```
//! use collection_hooks_core::json;
//! use collection_hooks_runtime::{CallOptions, HookedCollection};
//! use collection_hooks_testing::{InMemoryStore, Recorder};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(InMemoryStore::with_documents("orders", [json!({"_id": 1, "open": true})]));
//! let orders = HookedCollection::new(store.clone());
//! let deletes = Recorder::new();
//! orders.on("before.delete", deletes.listener()).unwrap();
//!
//! orders.delete_many(json!({"open": true}), &CallOptions::default()).await.unwrap();
//!
//! assert_eq!(deletes.len(), 1);
//! assert!(store.is_empty());
//! # });
//! ```

/// In-memory document store
pub mod memory_store;

/// Recording listeners
pub mod recorder;

/// Test helpers and utilities
pub mod helpers {
    use tracing_subscriber::EnvFilter;

    /// Route `tracing` output to the test harness.
    ///
    /// Honors `RUST_LOG`, defaulting to `debug` for the hooks crates. Safe to
    /// call from every test; only the first call installs a subscriber.
    pub fn init_tracing() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("collection_hooks_runtime=debug,collection_hooks_core=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use helpers::init_tracing;
pub use memory_store::InMemoryStore;
pub use recorder::Recorder;
