//! Invocation identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identity of one before → operation → after lifecycle.
///
/// A fresh id is allocated for every orchestrated call. The same id is seen by
/// every listener of that call (before, after-success, after-error), and a
/// nested call records it as its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(Uuid);

impl InvocationId {
    /// Allocate a new, globally unique id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| InvocationId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_copies_are_equal() {
        let id = InvocationId::new();
        let copy = id;
        assert_eq!(id, copy);
        assert_eq!(id.to_string(), copy.as_uuid().to_string());
    }
}
