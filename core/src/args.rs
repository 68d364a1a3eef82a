//! Argument records of the public collection operations.
//!
//! Before-listeners of a public operation receive its argument record as
//! JSON under `args` and may return a replacement of the same shape. Field
//! names are camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::projection::Projection;

/// Options of `insertMany`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InsertManyOptions {
    /// Insert documents strictly in order, stopping at the first failure
    pub ordered: bool,
}

impl Default for InsertManyOptions {
    fn default() -> Self {
        Self { ordered: true }
    }
}

/// Options of `updateOne`, `updateMany` and `replaceOne`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateOptions {
    /// Insert a record when nothing matches
    pub upsert: bool,
}

/// Options of `findOne` and `find`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FindOptions {
    /// Fields to return
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection: Option<Projection>,
    /// Sort specification, passed through to the store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    /// Maximum number of records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Number of records to skip
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
}

impl FindOptions {
    /// Options selecting only `projection`.
    #[must_use]
    pub fn projected(projection: Option<Projection>) -> Self {
        Self {
            projection,
            ..Self::default()
        }
    }

    /// Set the record limit.
    #[must_use]
    pub const fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Which version of the record a `findOneAnd*` call returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReturnDocument {
    /// The record as it was before the write
    #[default]
    Before,
    /// The record as it is after the write
    After,
}

/// Options of `findOneAndUpdate`, `findOneAndReplace` and `findOneAndDelete`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FindOneAndOptions {
    /// Fields of the returned record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection: Option<Projection>,
    /// Which record wins when several match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    /// Insert a record when nothing matches (ignored by delete)
    pub upsert: bool,
    /// Return the record before or after the write
    pub return_document: ReturnDocument,
}

/// `insertOne(document)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertOneArgs {
    /// The record to insert
    pub document: Value,
}

/// `insertMany(documents, options)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertManyArgs {
    /// The records to insert
    pub documents: Vec<Value>,
    /// Options
    #[serde(default)]
    pub options: InsertManyOptions,
}

/// `updateOne`/`updateMany(filter, mutator, options)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateArgs {
    /// Selects the records to update
    pub filter: Value,
    /// Update operators (`$set`, `$inc`, ...)
    pub mutator: Value,
    /// Options
    #[serde(default)]
    pub options: UpdateOptions,
}

/// `replaceOne(filter, replacement, options)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceArgs {
    /// Selects the record to replace
    pub filter: Value,
    /// The new record body
    pub replacement: Value,
    /// Options
    #[serde(default)]
    pub options: UpdateOptions,
}

/// `deleteOne`/`deleteMany(filter)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteArgs {
    /// Selects the records to delete
    pub filter: Value,
}

/// `findOne`/`find(filter, options)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindArgs {
    /// Selects the records to read
    pub filter: Value,
    /// Options
    #[serde(default)]
    pub options: FindOptions,
}

/// `aggregate(pipeline)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateArgs {
    /// Pipeline stages, passed through to the store
    pub pipeline: Vec<Value>,
}

/// `countDocuments(filter)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountArgs {
    /// Selects the records to count
    pub filter: Value,
}

/// `distinct(key, filter)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistinctArgs {
    /// Field whose distinct values are returned
    pub key: String,
    /// Selects the records to inspect
    pub filter: Value,
}

/// `findOneAndUpdate(filter, mutator, options)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOneAndUpdateArgs {
    /// Selects the record
    pub filter: Value,
    /// Update operators
    pub mutator: Value,
    /// Options
    #[serde(default)]
    pub options: FindOneAndOptions,
}

/// `findOneAndReplace(filter, replacement, options)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOneAndReplaceArgs {
    /// Selects the record
    pub filter: Value,
    /// The new record body
    pub replacement: Value,
    /// Options
    #[serde(default)]
    pub options: FindOneAndOptions,
}

/// `findOneAndDelete(filter, options)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOneAndDeleteArgs {
    /// Selects the record
    pub filter: Value,
    /// Options
    #[serde(default)]
    pub options: FindOneAndOptions,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names_are_camel_case() {
        let args = FindOneAndDeleteArgs {
            filter: json!({"a": 1}),
            options: FindOneAndOptions {
                return_document: ReturnDocument::After,
                ..FindOneAndOptions::default()
            },
        };
        let value = serde_json::to_value(&args).unwrap();
        assert_eq!(value["options"]["returnDocument"], json!("after"));
        assert_eq!(value["options"]["upsert"], json!(false));
    }

    #[test]
    fn test_missing_options_take_defaults() {
        let args: InsertManyArgs = serde_json::from_value(json!({"documents": [{}]})).unwrap();
        assert!(args.options.ordered);

        let args: FindArgs = serde_json::from_value(json!({
            "filter": {},
            "options": {"projection": {"name": 1}, "limit": 3}
        }))
        .unwrap();
        assert_eq!(args.options.projection, Some(Projection::include(["name"])));
        assert_eq!(args.options.limit, Some(3));
    }
}
