//! # Collection Hooks Core
//!
//! Data types and contracts for intercepting operations on a record store
//! with before/after listeners.
//!
//! This crate holds no runtime state. The event bus, document cache, batch
//! runner and the invocation orchestrator live in `collection-hooks-runtime`.
//!
//! ## Core Concepts
//!
//! - **Event**: `before.<target>`, `after.<target>.success`,
//!   `after.<target>.error` or `*` ([`event::EventName`])
//! - **Invocation**: one before → operation → after lifecycle, identified by an
//!   [`invocation::InvocationId`] shared by all of its phases
//! - **Payload**: what a listener sees ([`payload::HookPayload`]) and what it
//!   may return ([`payload::HookOutcome`])
//! - **Projection**: a field-selection spec; the specs of several listeners
//!   are merged with [`projection::union_of_projections`] so a record is
//!   fetched once
//! - **Store**: the wrapped collaborator ([`store::DocumentStore`])
//!
//! ## Example
//!
//! ```
//! use collection_hooks_core::event::{EventName, Phase};
//! use collection_hooks_core::projection::{union_of_projections, Projection};
//!
//! let name: EventName = "before.insert".parse().unwrap();
//! assert_eq!(name, EventName::lifecycle(Phase::Before, "insert"));
//!
//! let audit = Projection::include(["owner"]);
//! let index = Projection::include(["title"]);
//! let merged = union_of_projections([Some(&audit), Some(&index)]).unwrap();
//! assert_eq!(merged, Projection::include(["owner", "title"]));
//! ```

pub use serde::{Deserialize, Serialize};
pub use serde_json::{Value, json};

/// Operation argument records
pub mod args;

/// Record identity helpers
pub mod document;

/// Error types
pub mod error;

/// Event names and lifecycle phases
pub mod event;

/// Invocation identity
pub mod invocation;

/// Listener payloads and outcomes
pub mod payload;

/// Projection specs and their merge
pub mod projection;

/// Operation result records
pub mod results;

/// The wrapped document store
pub mod store;

pub use error::{HookError, Result, StoreError};
pub use event::{CursorKind, CursorOp, EventName, Phase};
pub use invocation::InvocationId;
pub use payload::{ChainKey, DocumentLookup, HookOutcome, HookPayload};
pub use projection::Projection;
pub use store::{DocumentStore, DocumentStream};
