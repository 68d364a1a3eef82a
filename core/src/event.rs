//! Event naming.
//!
//! Listeners register against an [`EventName`]. The textual forms are:
//!
//! | Form | Meaning |
//! |---|---|
//! | `before.<target>` | runs before the operation, may transform its input |
//! | `after.<target>.success` | runs after a successful operation, may transform its result |
//! | `after.<target>.error` | runs after a failed operation, observes the error |
//! | `after.<target>` | shorthand for `after.<target>.success` |
//! | `*` | every lifecycle phase of every target |
//!
//! Targets are public collection operations (`insertOne`, `updateMany`, ...),
//! per-record events (`insert`, `update`, `delete`) and cursor operations
//! (`find.cursor.next`, or the kind-agnostic alias `cursor.next`).

use std::fmt;
use std::str::FromStr;

use crate::error::HookError;

/// Public collection operations.
pub mod targets {
    /// `insertOne`
    pub const INSERT_ONE: &str = "insertOne";
    /// `insertMany`
    pub const INSERT_MANY: &str = "insertMany";
    /// `updateOne`
    pub const UPDATE_ONE: &str = "updateOne";
    /// `updateMany`
    pub const UPDATE_MANY: &str = "updateMany";
    /// `replaceOne`
    pub const REPLACE_ONE: &str = "replaceOne";
    /// `deleteOne`
    pub const DELETE_ONE: &str = "deleteOne";
    /// `deleteMany`
    pub const DELETE_MANY: &str = "deleteMany";
    /// `findOne`
    pub const FIND_ONE: &str = "findOne";
    /// `find`
    pub const FIND: &str = "find";
    /// `aggregate`
    pub const AGGREGATE: &str = "aggregate";
    /// `countDocuments`
    pub const COUNT_DOCUMENTS: &str = "countDocuments";
    /// `estimatedDocumentCount`
    pub const ESTIMATED_DOCUMENT_COUNT: &str = "estimatedDocumentCount";
    /// `distinct`
    pub const DISTINCT: &str = "distinct";
    /// `findOneAndUpdate`
    pub const FIND_ONE_AND_UPDATE: &str = "findOneAndUpdate";
    /// `findOneAndReplace`
    pub const FIND_ONE_AND_REPLACE: &str = "findOneAndReplace";
    /// `findOneAndDelete`
    pub const FIND_ONE_AND_DELETE: &str = "findOneAndDelete";

    /// Per-record insert, emitted once per inserted document
    pub const INSERT: &str = "insert";
    /// Per-record update, emitted once per modified record
    pub const UPDATE: &str = "update";
    /// Per-record delete, emitted once per removed record
    pub const DELETE: &str = "delete";

    /// Every operation target accepted by [`EventName`](super::EventName).
    pub const OPERATIONS: &[&str] = &[
        INSERT_ONE,
        INSERT_MANY,
        UPDATE_ONE,
        UPDATE_MANY,
        REPLACE_ONE,
        DELETE_ONE,
        DELETE_MANY,
        FIND_ONE,
        FIND,
        AGGREGATE,
        COUNT_DOCUMENTS,
        ESTIMATED_DOCUMENT_COUNT,
        DISTINCT,
        FIND_ONE_AND_UPDATE,
        FIND_ONE_AND_REPLACE,
        FIND_ONE_AND_DELETE,
        INSERT,
        UPDATE,
        DELETE,
    ];
}

/// Lifecycle phase an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Before the operation runs
    Before,
    /// After the operation succeeded
    AfterSuccess,
    /// After the operation failed
    AfterError,
}

impl Phase {
    /// Full event string for `target` in this phase.
    #[must_use]
    pub fn event_string(self, target: &str) -> String {
        match self {
            Self::Before => format!("before.{target}"),
            Self::AfterSuccess => format!("after.{target}.success"),
            Self::AfterError => format!("after.{target}.error"),
        }
    }

    /// Label used for metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::AfterSuccess => "after.success",
            Self::AfterError => "after.error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of cursor a cursor event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorKind {
    /// Cursor created by `find`
    Find,
    /// Cursor created by `aggregate`
    Aggregate,
}

impl CursorKind {
    /// The operation that creates this cursor kind.
    #[must_use]
    pub const fn creator(self) -> &'static str {
        match self {
            Self::Find => targets::FIND,
            Self::Aggregate => targets::AGGREGATE,
        }
    }
}

/// Operations available on a hooked cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorOp {
    /// Pull the next document
    Next,
    /// Drain the cursor into a vector
    ToArray,
    /// Visit every remaining document
    ForEach,
    /// Count the documents matched by the cursor's query
    Count,
    /// Reset the cursor to its first document
    Rewind,
    /// Release the cursor
    Close,
}

impl CursorOp {
    const ALL: [Self; 6] = [
        Self::Next,
        Self::ToArray,
        Self::ForEach,
        Self::Count,
        Self::Rewind,
        Self::Close,
    ];

    /// Sub-operation name as it appears in event strings.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Next => "next",
            Self::ToArray => "toArray",
            Self::ForEach => "forEach",
            Self::Count => "count",
            Self::Rewind => "rewind",
            Self::Close => "close",
        }
    }

    /// Kind-specific target, e.g. `find.cursor.next`.
    #[must_use]
    pub const fn target(self, kind: CursorKind) -> &'static str {
        match (kind, self) {
            (CursorKind::Find, Self::Next) => "find.cursor.next",
            (CursorKind::Find, Self::ToArray) => "find.cursor.toArray",
            (CursorKind::Find, Self::ForEach) => "find.cursor.forEach",
            (CursorKind::Find, Self::Count) => "find.cursor.count",
            (CursorKind::Find, Self::Rewind) => "find.cursor.rewind",
            (CursorKind::Find, Self::Close) => "find.cursor.close",
            (CursorKind::Aggregate, Self::Next) => "aggregate.cursor.next",
            (CursorKind::Aggregate, Self::ToArray) => "aggregate.cursor.toArray",
            (CursorKind::Aggregate, Self::ForEach) => "aggregate.cursor.forEach",
            (CursorKind::Aggregate, Self::Count) => "aggregate.cursor.count",
            (CursorKind::Aggregate, Self::Rewind) => "aggregate.cursor.rewind",
            (CursorKind::Aggregate, Self::Close) => "aggregate.cursor.close",
        }
    }

    /// Kind-agnostic alias target, e.g. `cursor.next`.
    #[must_use]
    pub const fn alias(self) -> &'static str {
        match self {
            Self::Next => "cursor.next",
            Self::ToArray => "cursor.toArray",
            Self::ForEach => "cursor.forEach",
            Self::Count => "cursor.count",
            Self::Rewind => "cursor.rewind",
            Self::Close => "cursor.close",
        }
    }
}

fn is_valid_target(target: &str) -> bool {
    if targets::OPERATIONS.contains(&target) {
        return true;
    }
    let (prefix, op) = match target.rsplit_once(".cursor.") {
        Some((kind, op)) => (Some(kind), op),
        None => match target.strip_prefix("cursor.") {
            Some(op) => (None, op),
            None => return false,
        },
    };
    let kind_ok = prefix.is_none_or(|kind| kind == targets::FIND || kind == targets::AGGREGATE);
    kind_ok && CursorOp::ALL.iter().any(|candidate| candidate.as_str() == op)
}

/// A listener registration key.
///
/// # Examples
///
/// ```
/// use collection_hooks_core::event::{EventName, Phase};
///
/// let name: EventName = "after.updateOne.success".parse().unwrap();
/// assert_eq!(name, EventName::lifecycle(Phase::AfterSuccess, "updateOne"));
/// assert_eq!(name.to_string(), "after.updateOne.success");
///
/// assert!("before.teleport".parse::<EventName>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventName {
    /// A specific phase of a specific target
    Lifecycle {
        /// Lifecycle phase
        phase: Phase,
        /// Operation, per-record event or cursor target
        target: String,
    },
    /// `*`: every phase of every target
    Wildcard,
}

impl EventName {
    /// Event for `phase` of `target` (not validated).
    pub fn lifecycle(phase: Phase, target: impl Into<String>) -> Self {
        Self::Lifecycle {
            phase,
            target: target.into(),
        }
    }

    /// `before.<target>`
    pub fn before(target: impl Into<String>) -> Self {
        Self::lifecycle(Phase::Before, target)
    }

    /// `after.<target>.success`
    pub fn after_success(target: impl Into<String>) -> Self {
        Self::lifecycle(Phase::AfterSuccess, target)
    }

    /// `after.<target>.error`
    pub fn after_error(target: impl Into<String>) -> Self {
        Self::lifecycle(Phase::AfterError, target)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lifecycle { phase, target } => f.write_str(&phase.event_string(target)),
            Self::Wildcard => f.write_str("*"),
        }
    }
}

impl FromStr for EventName {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Self::Wildcard);
        }
        let invalid = || HookError::InvalidEventName(s.to_string());

        let (phase, target) = if let Some(target) = s.strip_prefix("before.") {
            (Phase::Before, target)
        } else if let Some(rest) = s.strip_prefix("after.") {
            if let Some(target) = rest.strip_suffix(".success") {
                (Phase::AfterSuccess, target)
            } else if let Some(target) = rest.strip_suffix(".error") {
                (Phase::AfterError, target)
            } else {
                (Phase::AfterSuccess, rest)
            }
        } else {
            return Err(invalid());
        };

        if !is_valid_target(target) {
            return Err(invalid());
        }
        Ok(Self::lifecycle(phase, target))
    }
}

impl TryFrom<&str> for EventName {
    type Error = HookError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_forms() {
        assert_eq!(
            "before.insertOne".parse::<EventName>().unwrap(),
            EventName::before("insertOne")
        );
        assert_eq!(
            "after.delete.error".parse::<EventName>().unwrap(),
            EventName::after_error("delete")
        );
        assert_eq!(
            "after.findOne".parse::<EventName>().unwrap(),
            EventName::after_success("findOne")
        );
        assert_eq!("*".parse::<EventName>().unwrap(), EventName::Wildcard);
    }

    #[test]
    fn test_parse_cursor_targets() {
        assert_eq!(
            "before.find.cursor.next".parse::<EventName>().unwrap(),
            EventName::before("find.cursor.next")
        );
        assert_eq!(
            "after.cursor.toArray.success".parse::<EventName>().unwrap(),
            EventName::after_success("cursor.toArray")
        );
        assert!("before.distinct.cursor.next".parse::<EventName>().is_err());
        assert!("before.find.cursor.explode".parse::<EventName>().is_err());
    }

    #[test]
    fn test_rejects_unknown() {
        for bad in ["", "before", "before.", "around.insertOne", "after.nothing.success"] {
            assert!(bad.parse::<EventName>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let name = EventName::after_error(CursorOp::ForEach.target(CursorKind::Aggregate));
        assert_eq!(name.to_string(), "after.aggregate.cursor.forEach.error");
        assert_eq!(name.to_string().parse::<EventName>().unwrap(), name);
    }
}
