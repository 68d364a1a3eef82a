//! Result records of the write operations.
//!
//! After-success listeners receive these as JSON under `result` and may
//! replace them with another record of the same shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Result of `insertOne`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertOneResult {
    /// Whether the store accepted the write
    pub acknowledged: bool,
    /// Identifier of the new record (`null` when the insert was skipped)
    pub inserted_id: Value,
}

impl InsertOneResult {
    /// Result of an insert a before-listener skipped.
    #[must_use]
    pub const fn skipped() -> Self {
        Self {
            acknowledged: false,
            inserted_id: Value::Null,
        }
    }
}

/// Result of `insertMany`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertManyResult {
    /// Whether the store accepted the write
    pub acknowledged: bool,
    /// Identifiers of the inserted records, keyed by input position
    pub inserted_ids: BTreeMap<usize, Value>,
}

impl InsertManyResult {
    /// Number of inserted records.
    #[must_use]
    pub fn inserted_count(&self) -> usize {
        self.inserted_ids.len()
    }
}

/// Result of `updateOne`, `updateMany` and `replaceOne`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    /// Whether the store accepted the write
    pub acknowledged: bool,
    /// Records matched by the filter
    pub matched_count: u64,
    /// Records actually changed
    pub modified_count: u64,
    /// Identifier of the record created by an upsert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upserted_id: Option<Value>,
}

impl UpdateResult {
    /// Fold a per-record result into this total.
    pub fn absorb(&mut self, other: &Self) {
        self.acknowledged |= other.acknowledged;
        self.matched_count += other.matched_count;
        self.modified_count += other.modified_count;
        if other.upserted_id.is_some() {
            self.upserted_id.clone_from(&other.upserted_id);
        }
    }
}

/// Result of `deleteOne` and `deleteMany`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    /// Whether the store accepted the write
    pub acknowledged: bool,
    /// Records removed
    pub deleted_count: u64,
}

impl DeleteResult {
    /// Fold a per-record result into this total.
    pub const fn absorb(&mut self, other: &Self) {
        self.acknowledged |= other.acknowledged;
        self.deleted_count += other.deleted_count;
    }
}
