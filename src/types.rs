//! Core types for spark-reactions.
//!
//! These types flow through the reaction network: actions go in at a node,
//! mutations come out of derive functions and are applied to render targets.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Payloads
// =============================================================================

/// Attribute/prop bag carried by a mutation.
///
/// Merging is key-wise: later writes win for overlapping keys.
pub type PropBag = serde_json::Map<String, Value>;

/// Merge `src` onto `dst`, overwriting overlapping keys.
pub fn merge_bag(dst: &mut PropBag, src: &PropBag) {
    for (key, value) in src {
        dst.insert(key.clone(), value.clone());
    }
}

// =============================================================================
// Action
// =============================================================================

/// A causally-tagged event submitted to the reaction network.
///
/// Describes *why* something changed. Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Action type tag (e.g. "hover", "select").
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload.
    #[serde(default)]
    pub payload: Value,
}

impl Action {
    /// Create an action with no payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Value::Null,
        }
    }

    /// Create an action carrying a payload.
    pub fn with_payload(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Check the action type tag.
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

// =============================================================================
// Event keys and scopes
// =============================================================================

/// Identifies a descendant of a render handle (a data point, a list row...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventKey {
    Index(usize),
    Name(String),
}

impl From<usize> for EventKey {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for EventKey {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for EventKey {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// Where on a render handle a mutation lands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// The handle's own root state.
    Root,
    /// One descendant of the handle.
    Descendant(EventKey),
}

impl Scope {
    /// Expand an optional event key list into the scopes it addresses.
    pub fn expand(event_key: Option<&[EventKey]>) -> Vec<Scope> {
        match event_key {
            None => vec![Scope::Root],
            Some(keys) => keys.iter().cloned().map(Scope::Descendant).collect(),
        }
    }

    /// Whether an event key list addresses this scope.
    pub fn is_addressed_by(&self, event_key: Option<&[EventKey]>) -> bool {
        match (self, event_key) {
            (Scope::Root, None) => true,
            (Scope::Descendant(key), Some(keys)) => keys.contains(key),
            _ => false,
        }
    }
}

// =============================================================================
// Mutation
// =============================================================================

/// Lifetime class of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Written straight onto the attribute surface. Gone after the next render.
    ImperativeAttribute,
    /// Prop override that lives for exactly one prop generation.
    #[default]
    TransientProp,
    /// Prop override that lives until replaced by a mutation with the same key.
    StickyProp,
}

impl MutationKind {
    /// The single-bit mask for this kind.
    pub fn mask(self) -> MutationKinds {
        match self {
            Self::ImperativeAttribute => MutationKinds::IMPERATIVE_ATTRIBUTE,
            Self::TransientProp => MutationKinds::TRANSIENT_PROP,
            Self::StickyProp => MutationKinds::STICKY_PROP,
        }
    }
}

bitflags::bitflags! {
    /// Set of mutation kinds, used to filter listeners and wrapped components.
    ///
    /// Combine with bitwise OR: `MutationKinds::TRANSIENT_PROP | MutationKinds::STICKY_PROP`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MutationKinds: u8 {
        const IMPERATIVE_ATTRIBUTE = 1 << 0;
        const TRANSIENT_PROP = 1 << 1;
        const STICKY_PROP = 1 << 2;
        const PROPS = Self::TRANSIENT_PROP.bits() | Self::STICKY_PROP.bits();
        const ALL = Self::IMPERATIVE_ATTRIBUTE.bits() | Self::PROPS.bits();
    }
}

impl Default for MutationKinds {
    fn default() -> Self {
        Self::ALL
    }
}

/// A declarative description of an imperative change to render targets.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Mutation {
    /// Lifetime class.
    #[serde(default)]
    pub kind: MutationKind,
    /// Target patterns; a handle must match at least one.
    pub target: Vec<String>,
    /// Exclude patterns; a handle matching any of these is skipped.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Descendants of the matched handle to narrow application to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_key: Option<Vec<EventKey>>,
    /// Attribute/prop bag.
    #[serde(default)]
    pub payload: PropBag,
}

impl Mutation {
    /// Transient prop mutation targeting the given patterns.
    pub fn new<I, S>(target: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target: target.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the lifetime class.
    pub fn kind(mut self, kind: MutationKind) -> Self {
        self.kind = kind;
        self
    }

    /// Shorthand for `kind(MutationKind::ImperativeAttribute)`.
    pub fn imperative(self) -> Self {
        self.kind(MutationKind::ImperativeAttribute)
    }

    /// Shorthand for `kind(MutationKind::StickyProp)`.
    pub fn sticky(self) -> Self {
        self.kind(MutationKind::StickyProp)
    }

    /// Add exclude patterns.
    pub fn exclude<I, S>(mut self, exclude: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(exclude.into_iter().map(Into::into));
        self
    }

    /// Narrow application to descendants of matched handles.
    pub fn event_key<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<EventKey>,
    {
        self.event_key = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Set one payload entry.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Replace the payload with the entries of a JSON object.
    ///
    /// Non-object values leave the payload empty.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = match payload {
            Value::Object(map) => map,
            _ => PropBag::new(),
        };
        self
    }

    /// Scopes this mutation addresses on a matched handle.
    pub fn scopes(&self) -> Vec<Scope> {
        Scope::expand(self.event_key.as_deref())
    }
}
