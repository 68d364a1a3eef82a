//! # Collection Hooks Runtime
//!
//! The hook engine: listener registry, invocation lifecycle, per-invocation
//! document cache, batched fan-out, and the hooked collection and cursor
//! façades built on top of them.
//!
//! ## Core Components
//!
//! - **[`EventBus`]**: registry of listeners keyed by event name, dispatching
//!   in parallel or as a transforming chain
//! - **[`Orchestrator`]**: runs an operation inside its before/after
//!   lifecycle (`try_catch_emit`)
//! - **[`DocumentCache`]**: shares one store read per record among the
//!   listeners of an operation
//! - **[`run_batched`]**: ordered or unordered fan-out with cancellation
//! - **[`HookedCollection`] / [`HookedCursor`]**: the public surface
//!
//! ## Example
//!
//! ```
//! use collection_hooks_core::{HookOutcome, json};
//! use collection_hooks_runtime::{CallOptions, HookedCollection, Listener};
//! use collection_hooks_testing::InMemoryStore;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let orders = HookedCollection::new(Arc::new(InMemoryStore::new("orders")));
//! orders
//!     .on(
//!         "after.countDocuments",
//!         Listener::sync(|payload| {
//!             let count = payload.result.as_ref().and_then(|v| v.as_u64()).unwrap_or(0);
//!             Ok(HookOutcome::Replace(json!(count + 100)))
//!         }),
//!     )
//!     .unwrap();
//!
//! let count = orders.count_documents(json!({}), &CallOptions::default()).await.unwrap();
//! assert_eq!(count, 100);
//! # });
//! ```

/// Cancellation signals
pub mod abort;

/// Ordered and unordered fan-out
pub mod batch;

/// Listener registry and dispatch
pub mod bus;

/// Per-invocation document cache
pub mod cache;

/// Hooked collection façade
pub mod collection;

/// Collection-wide and per-call configuration
pub mod config;

/// Hooked cursor façade
pub mod cursor;

/// Listener handles and their options
pub mod listener;

/// Metric names and registration
pub mod metrics;

/// The invocation lifecycle
pub mod orchestrator;

pub use abort::AbortSignal;
pub use batch::{ItemFlow, ItemOutcome, run_batched};
pub use bus::{Chained, EventBus, EventSet};
pub use cache::DocumentCache;
pub use collection::HookedCollection;
pub use config::{CallOptions, DEFAULT_HOOK_BATCH_SIZE, HooksConfig};
pub use cursor::HookedCursor;
pub use listener::{HookOptions, Listener, ListenerId};
pub use orchestrator::{Emit, Emitted, Orchestrator};
