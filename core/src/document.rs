//! Record identity helpers.
//!
//! Records are JSON documents (`serde_json::Value`). Every record carries its
//! identifier under [`ID_FIELD`].

use serde_json::{Map, Value};
use std::fmt;

/// Name of the identifier field of a record.
pub const ID_FIELD: &str = "_id";

/// Hashable key for a record identifier.
///
/// Identifiers may be any JSON value. The key is the value's canonical JSON
/// text, so `"1"` (a string) and `1` (a number) are different keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    /// Key for an identifier value.
    #[must_use]
    pub fn from_value(id: &Value) -> Self {
        Self(id.to_string())
    }

    /// The canonical JSON text of the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Value> for DocumentId {
    fn from(value: &Value) -> Self {
        Self::from_value(value)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identifier of `doc`, if it has one.
#[must_use]
pub fn id_of(doc: &Value) -> Option<&Value> {
    doc.get(ID_FIELD)
}

/// Narrow `filter` to the record identified by `id`.
///
/// Object filters keep their other constraints. Anything else is replaced by
/// `{ "_id": id }`.
#[must_use]
pub fn with_id(filter: &Value, id: &Value) -> Value {
    let mut narrowed = match filter {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    narrowed.insert(ID_FIELD.to_string(), id.clone());
    Value::Object(narrowed)
}

/// `{ "_id": { "$in": ids } }`
#[must_use]
pub fn ids_filter(ids: &[Value]) -> Value {
    serde_json::json!({ ID_FIELD: { "$in": ids } })
}
