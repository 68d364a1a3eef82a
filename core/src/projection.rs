//! Field-selection specifications and their union.
//!
//! A [`Projection`] is a tree whose leaves are *include* (`1`) or *exclude*
//! (`0`). A spec is either inclusion-style (only listed fields are returned,
//! plus `_id` unless `_id: 0` is given) or exclusion-style (everything except
//! the listed fields is returned). `_id` may be excluded from an
//! inclusion-style spec at the top level only.
//!
//! Several listeners may each declare the fields they need from a record.
//! [`union_of_projections`] merges those declarations into one spec that
//! returns at least every field any of them asked for, so the record is
//! fetched once.
//!
//! # Merge model
//!
//! [`combine`] merges two nodes. Two specs of the same style merge key by key:
//! inclusions add up, exclusions keep only what both sides exclude. An
//! exclusion met by a caller that needs the field, explicitly or by leaving it
//! out of an inclusion-style spec, is lifted. Wherever the two styles meet,
//! the merged node is the whole subtree. This over-fetches but never drops a
//! field someone asked for, and makes the merge order-independent.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::document::ID_FIELD;
use crate::error::HookError;

/// Error for malformed projection documents.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid projection: {0}")]
pub struct InvalidProjection(String);

impl From<InvalidProjection> for HookError {
    fn from(err: InvalidProjection) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A field-selection specification.
///
/// # Examples
///
/// ```
/// use collection_hooks_core::projection::Projection;
/// use serde_json::json;
///
/// let spec = Projection::try_from(&json!({"name": 1, "address.city": 1})).unwrap();
/// assert_eq!(spec, Projection::include(["name", "address.city"]));
/// assert_eq!(spec.to_value(), json!({"address": {"city": 1}, "name": 1}));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Projection {
    /// `1`: the whole field
    Include,
    /// `0`: none of the field
    Exclude,
    /// A nested spec; an empty map means "no restriction"
    Fields(BTreeMap<String, Projection>),
}

impl Projection {
    /// The empty spec, which restricts nothing.
    #[must_use]
    pub const fn unrestricted() -> Self {
        Self::Fields(BTreeMap::new())
    }

    /// Inclusion-style spec over dotted `paths`.
    pub fn include<'a>(paths: impl IntoIterator<Item = &'a str>) -> Self {
        Self::from_paths(paths, Self::Include)
    }

    /// Exclusion-style spec over dotted `paths`.
    pub fn exclude<'a>(paths: impl IntoIterator<Item = &'a str>) -> Self {
        Self::from_paths(paths, Self::Exclude)
    }

    fn from_paths<'a>(paths: impl IntoIterator<Item = &'a str>, leaf: Self) -> Self {
        let mut fields = BTreeMap::new();
        for path in paths {
            insert_path(&mut fields, path, leaf.clone());
        }
        Self::Fields(fields)
    }

    /// Add `_id: 0` to a top-level spec.
    #[must_use]
    pub fn without_id(self) -> Self {
        match self {
            Self::Fields(mut fields) => {
                fields.insert(ID_FIELD.to_string(), Self::Exclude);
                Self::Fields(fields)
            },
            other => other,
        }
    }

    /// Drop a top-level `_id: 0`, so `_id` is returned whatever the style.
    #[must_use]
    pub fn keep_id(self) -> Self {
        match self {
            Self::Fields(mut fields) => {
                if fields.get(ID_FIELD) == Some(&Self::Exclude) {
                    fields.remove(ID_FIELD);
                }
                Self::Fields(fields)
            },
            other => other,
        }
    }

    /// Whether this is an empty spec (returns everything).
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Self::Fields(fields) if fields.is_empty())
    }

    /// Whether this top-level spec is exclusion-style.
    #[must_use]
    pub fn is_exclusion(&self) -> bool {
        match self {
            Self::Include => false,
            Self::Exclude => true,
            Self::Fields(fields) => map_style(fields, 0).unwrap_or(false),
        }
    }

    /// JSON form: `1`, `0` or a nested object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Include => Value::from(1),
            Self::Exclude => Value::from(0),
            Self::Fields(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, sub)| (key.clone(), sub.to_value()))
                    .collect(),
            ),
        }
    }

    /// Apply this top-level spec to `doc`, returning the selected fields.
    ///
    /// Non-object documents are returned unchanged.
    #[must_use]
    pub fn apply(&self, doc: &Value) -> Value {
        let Value::Object(source) = doc else {
            return doc.clone();
        };
        match self {
            Self::Include => doc.clone(),
            Self::Exclude => Value::Object(Map::new()),
            Self::Fields(fields) if fields.is_empty() => doc.clone(),
            Self::Fields(fields) => {
                if self.is_exclusion() {
                    Value::Object(apply_exclusion(fields, source))
                } else {
                    let mut selected = apply_inclusion(fields, source);
                    let id_excluded = matches!(fields.get(ID_FIELD), Some(Self::Exclude));
                    if !id_excluded {
                        if let Some(id) = source.get(ID_FIELD) {
                            selected.insert(ID_FIELD.to_string(), id.clone());
                        }
                    }
                    Value::Object(selected)
                }
            },
        }
    }
}

fn insert_path(fields: &mut BTreeMap<String, Projection>, path: &str, leaf: Projection) {
    match path.split_once('.') {
        None => {
            fields.insert(path.to_string(), leaf);
        },
        Some((head, rest)) => {
            let entry = fields
                .entry(head.to_string())
                .or_insert_with(Projection::unrestricted);
            // A leaf already covers every sub-path.
            if let Projection::Fields(nested) = entry {
                insert_path(nested, rest, leaf);
            }
        },
    }
}

/// Style of a nested map: `Some(true)` exclusion, `Some(false)` inclusion,
/// `None` when the map holds no deciding leaf.
fn map_style(fields: &BTreeMap<String, Projection>, depth: usize) -> Option<bool> {
    for (key, sub) in fields {
        if depth == 0 && key == ID_FIELD {
            continue;
        }
        match sub {
            Projection::Include => return Some(false),
            Projection::Exclude => return Some(true),
            Projection::Fields(nested) => {
                if let Some(style) = map_style(nested, depth + 1) {
                    return Some(style);
                }
            },
        }
    }
    if depth == 0 {
        return match fields.get(ID_FIELD) {
            Some(Projection::Exclude) => Some(true),
            Some(Projection::Include) => Some(false),
            _ => None,
        };
    }
    None
}

fn apply_inclusion(fields: &BTreeMap<String, Projection>, source: &Map<String, Value>) -> Map<String, Value> {
    let mut selected = Map::new();
    for (key, sub) in fields {
        let Some(value) = source.get(key) else {
            continue;
        };
        match sub {
            Projection::Include => {
                selected.insert(key.clone(), value.clone());
            },
            Projection::Exclude => {},
            Projection::Fields(nested) if nested.is_empty() => {
                selected.insert(key.clone(), value.clone());
            },
            Projection::Fields(nested) => match value {
                Value::Object(inner) => {
                    selected.insert(key.clone(), Value::Object(apply_inclusion(nested, inner)));
                },
                Value::Array(items) => {
                    let projected = items
                        .iter()
                        .filter_map(|item| match item {
                            Value::Object(inner) => Some(Value::Object(apply_inclusion(nested, inner))),
                            _ => None,
                        })
                        .collect();
                    selected.insert(key.clone(), Value::Array(projected));
                },
                _ => {},
            },
        }
    }
    selected
}

fn apply_exclusion(fields: &BTreeMap<String, Projection>, source: &Map<String, Value>) -> Map<String, Value> {
    let mut selected = source.clone();
    for (key, sub) in fields {
        match sub {
            Projection::Exclude => {
                selected.remove(key);
            },
            Projection::Include => {},
            Projection::Fields(nested) => {
                if let Some(value) = selected.get_mut(key) {
                    match value {
                        Value::Object(inner) => *inner = apply_exclusion(nested, inner),
                        Value::Array(items) => {
                            for item in items.iter_mut() {
                                if let Value::Object(inner) = item {
                                    *inner = apply_exclusion(nested, inner);
                                }
                            }
                        },
                        _ => {},
                    }
                }
            },
        }
    }
    selected
}

impl TryFrom<&Value> for Projection {
    type Error = InvalidProjection;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(true) => Ok(Self::Include),
            Value::Bool(false) => Ok(Self::Exclude),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f == 0.0 => Ok(Self::Exclude),
                Some(_) => Ok(Self::Include),
                None => Err(InvalidProjection(format!("unreadable number {n}"))),
            },
            Value::Object(map) => {
                let mut fields = BTreeMap::new();
                for (key, sub) in map {
                    if key.is_empty() || key.starts_with('.') || key.ends_with('.') {
                        return Err(InvalidProjection(format!("bad field path '{key}'")));
                    }
                    insert_path(&mut fields, key, Self::try_from(sub)?);
                }
                Ok(Self::Fields(fields))
            },
            other => Err(InvalidProjection(format!("unexpected value {other}"))),
        }
    }
}

impl TryFrom<Value> for Projection {
    type Error = InvalidProjection;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::try_from(&value)
    }
}

impl Serialize for Projection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Projection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::try_from(&value).map_err(D::Error::custom)
    }
}

/// Result of [`combine`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Combined {
    /// Whether the merged node is exclusion-style
    pub is_exclusion: bool,
    /// The merged node.
    ///
    /// `Some(Projection::Fields(empty))` means "no explicit restriction";
    /// `None` means "drop the key" (implicitly included by an exclusion-style
    /// parent).
    pub projection: Option<Projection>,
    /// Whether the merged node is a nested map
    pub has_nested_keys: bool,
}

/// Requirement on one node, read in the style of the map holding it.
///
/// Inclusion-side values order as `Unlisted < Only < All` and exclusion-side
/// values as `Excluded < Except < All`. Values of different sides only meet at
/// `All`. Maps are kept canonical: children equal to the map's default are
/// removed, so equal needs select the same fields.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Need {
    All,
    /// Not listed by an inclusion-style parent
    Unlisted,
    /// `0` under an exclusion-style parent
    Excluded,
    /// Inclusion-style map; unlisted children are not needed
    Only(BTreeMap<String, Need>),
    /// Exclusion-style map; unlisted children are needed whole
    Except(BTreeMap<String, Need>),
}

impl Need {
    fn only(mut children: BTreeMap<String, Self>) -> Self {
        children.retain(|_, child| *child != Self::Unlisted);
        if children.is_empty() {
            Self::Unlisted
        } else {
            Self::Only(children)
        }
    }

    fn except(mut children: BTreeMap<String, Self>) -> Self {
        children.retain(|_, child| *child != Self::All);
        if children.is_empty() {
            Self::All
        } else {
            Self::Except(children)
        }
    }

    const fn is_exclusion_side(&self) -> bool {
        matches!(self, Self::Excluded | Self::Except(_))
    }

    fn union(self, other: Self) -> Self {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => Self::All,
            (Self::Unlisted, other) | (other, Self::Unlisted) if !other.is_exclusion_side() => other,
            (Self::Excluded, Self::Excluded) => Self::Excluded,
            (Self::Excluded, Self::Except(children)) | (Self::Except(children), Self::Excluded) => {
                Self::Except(children)
            },
            (Self::Only(left), Self::Only(right)) => Self::only(union_children(left, right, &Self::Unlisted)),
            (Self::Except(left), Self::Except(right)) => Self::except(union_children(left, right, &Self::All)),
            // One side of each style.
            _ => Self::All,
        }
    }
}

fn union_children(
    mut left: BTreeMap<String, Need>,
    mut right: BTreeMap<String, Need>,
    missing: &Need,
) -> BTreeMap<String, Need> {
    let keys: BTreeSet<String> = left.keys().chain(right.keys()).cloned().collect();
    keys.into_iter()
        .map(|key| {
            let l = left.remove(&key).unwrap_or_else(|| missing.clone());
            let r = right.remove(&key).unwrap_or_else(|| missing.clone());
            (key, l.union(r))
        })
        .collect()
}

/// Read `value` as a need. `parent_is_exclusion` decides what an absent value
/// means; `depth` is the nesting level of `value` itself.
fn resolve(value: Option<&Projection>, parent_is_exclusion: bool, depth: usize) -> Need {
    match value {
        None if parent_is_exclusion => Need::All,
        None => Need::Unlisted,
        Some(Projection::Include) => Need::All,
        Some(Projection::Exclude) if parent_is_exclusion => Need::Excluded,
        Some(Projection::Exclude) => Need::Unlisted,
        Some(Projection::Fields(fields)) if fields.is_empty() => Need::All,
        Some(Projection::Fields(fields)) => {
            let exclusion = map_style(fields, depth).unwrap_or(parent_is_exclusion);
            if exclusion != parent_is_exclusion {
                // Cannot be written under this parent: take the whole subtree.
                return Need::All;
            }
            let children = fields
                .iter()
                .map(|(key, sub)| (key.clone(), resolve(Some(sub), exclusion, depth + 1)))
                .collect();
            if exclusion {
                Need::except(children)
            } else {
                Need::only(children)
            }
        },
    }
}

fn render(children: &BTreeMap<String, Need>) -> BTreeMap<String, Projection> {
    children
        .iter()
        .filter_map(|(key, child)| {
            let written = match child {
                Need::All => Projection::Include,
                Need::Excluded => Projection::Exclude,
                Need::Only(nested) | Need::Except(nested) => Projection::Fields(render(nested)),
                Need::Unlisted => return None,
            };
            Some((key.clone(), written))
        })
        .collect()
}

/// A whole spec: the need of its fields other than `_id`, and whether `_id`
/// is left out.
struct RecordNeed {
    fields: Need,
    without_id: bool,
}

impl RecordNeed {
    /// `None` is the whole record.
    fn read(spec: Option<&Projection>) -> Self {
        let (fields, without_id) = match spec {
            None | Some(Projection::Include) => (Need::All, false),
            Some(Projection::Exclude) => (Need::Unlisted, false),
            Some(Projection::Fields(fields)) if fields.is_empty() => (Need::All, false),
            Some(Projection::Fields(fields)) => {
                let exclusion = map_style(fields, 0).unwrap_or(false);
                let children = fields
                    .iter()
                    .filter(|(key, _)| *key != ID_FIELD)
                    .map(|(key, sub)| (key.clone(), resolve(Some(sub), exclusion, 1)))
                    .collect();
                let need = if exclusion {
                    Need::except(children)
                } else {
                    Need::only(children)
                };
                (need, fields.get(ID_FIELD) == Some(&Projection::Exclude))
            },
        };
        Self { fields, without_id }
    }

    fn union(self, other: Self) -> Self {
        Self {
            fields: self.fields.union(other.fields),
            // Dropped only when both sides drop it.
            without_id: self.without_id && other.without_id,
        }
    }

    fn is_exclusion(&self) -> bool {
        match self.fields {
            Need::All => self.without_id,
            Need::Excluded | Need::Except(_) => true,
            Need::Unlisted | Need::Only(_) => false,
        }
    }

    /// `None` when nothing is restricted.
    fn render(&self) -> Option<Projection> {
        let mut fields = match &self.fields {
            Need::All => BTreeMap::new(),
            Need::Unlisted | Need::Excluded => return Some(Projection::include([ID_FIELD])),
            Need::Only(children) | Need::Except(children) => render(children),
        };
        if self.without_id {
            fields.insert(ID_FIELD.to_string(), Projection::Exclude);
        }
        (!fields.is_empty()).then_some(Projection::Fields(fields))
    }
}

/// Merge two projection nodes.
///
/// `left`/`right` are the values the two specs hold for the same key (`None`
/// when a spec does not list it), the `*_parent_is_exclusion` flags give the
/// style of the map each value sits in, and `depth` is the nesting level of the
/// values.
///
/// Below the top level:
///
/// - two includes stay an include and two excludes stay an exclude
/// - an exclude against an include, or against a key an inclusion-style parent
///   does not list, gives [`Projection::unrestricted`]
/// - an include against a key an exclusion-style parent does not list gives
///   `None`: drop the key, it is returned already
/// - maps merge key by key; a map whose style differs from its parent's takes
///   the whole subtree
///
/// At depth `0` the values are whole specs and `None` is the whole record. The
/// merged `_id` is excluded only when both specs exclude it, and
/// [`Combined::projection`] is `None` when the merge restricts nothing.
///
/// # Examples
///
/// ```
/// use collection_hooks_core::projection::{combine, Combined, Projection};
///
/// // An exclusion loses to a caller that needs the field.
/// let merged = combine(Some(&Projection::Exclude), Some(&Projection::Include), true, false, 1);
/// assert_eq!(
///     merged,
///     Combined { is_exclusion: false, projection: Some(Projection::unrestricted()), has_nested_keys: false }
/// );
/// ```
#[must_use]
pub fn combine(
    left: Option<&Projection>,
    right: Option<&Projection>,
    left_parent_is_exclusion: bool,
    right_parent_is_exclusion: bool,
    depth: usize,
) -> Combined {
    if depth == 0 {
        let merged = RecordNeed::read(left).union(RecordNeed::read(right));
        return Combined {
            is_exclusion: merged.is_exclusion(),
            has_nested_keys: matches!(merged.fields, Need::Only(_) | Need::Except(_)),
            projection: merged.render(),
        };
    }
    let both_include = left == Some(&Projection::Include) && right == Some(&Projection::Include);
    let implicit =
        (left.is_none() && left_parent_is_exclusion) || (right.is_none() && right_parent_is_exclusion);
    let need = resolve(left, left_parent_is_exclusion, depth)
        .union(resolve(right, right_parent_is_exclusion, depth));
    let (is_exclusion, projection) = match need {
        Need::All if both_include || (!left_parent_is_exclusion && !right_parent_is_exclusion) => {
            (false, Some(Projection::Include))
        },
        Need::All if implicit => (false, None),
        Need::All => (false, Some(Projection::unrestricted())),
        Need::Unlisted => (false, None),
        Need::Excluded => (true, Some(Projection::Exclude)),
        Need::Only(children) => (false, Some(Projection::Fields(render(&children)))),
        Need::Except(children) => (true, Some(Projection::Fields(render(&children)))),
    };
    Combined {
        is_exclusion,
        has_nested_keys: matches!(projection, Some(Projection::Fields(ref fields)) if !fields.is_empty()),
        projection,
    }
}

/// Merge every spec in `specs` into one spec covering all of them.
///
/// `None` entries stand for callers that need the whole record. The specs are
/// folded left to right with [`combine`] at the top level. The result is
/// `None` when the merged spec restricts nothing (fetch the whole record).
/// When every caller explicitly needs nothing, the result selects only `_id`.
///
/// # Examples
///
/// ```
/// use collection_hooks_core::projection::{union_of_projections, Projection};
///
/// let a = Projection::include(["name"]);
/// let b = Projection::include(["email"]).without_id();
/// assert_eq!(
///     union_of_projections([Some(&a), Some(&b)]),
///     Some(Projection::include(["email", "name"]))
/// );
/// assert_eq!(union_of_projections([Some(&a), None]), None);
/// ```
pub fn union_of_projections<'a>(
    specs: impl IntoIterator<Item = Option<&'a Projection>>,
) -> Option<Projection> {
    let mut specs = specs.into_iter();
    let mut merged = RecordNeed::read(specs.next()?).render();
    for spec in specs {
        let left_is_exclusion = merged.as_ref().is_some_and(Projection::is_exclusion);
        let right_is_exclusion = spec.is_some_and(Projection::is_exclusion);
        merged = combine(merged.as_ref(), spec, left_is_exclusion, right_is_exclusion, 0).projection;
    }
    merged
}
