use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::event::SourceEvent;

/// Derives one key value from an event. Returning `None` omits the field.
pub type KeyDeriver = Arc<dyn Fn(&SourceEvent) -> Option<Value> + Send + Sync>;

/// How a single grouping-key field is obtained from an event.
#[derive(Clone)]
pub enum KeyField {
    /// Copy the event's same-named top-level field.
    Literal,
    /// Compute the value from the whole event.
    Derived(KeyDeriver),
}

impl KeyField {
    /// Derivation that resolves a dotted path on the event.
    pub fn path(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::Derived(Arc::new(move |event| event.lookup(&path).cloned()))
    }

    /// Derivation backed by an arbitrary closure.
    pub fn derived<F>(f: F) -> Self
    where
        F: Fn(&SourceEvent) -> Option<Value> + Send + Sync + 'static,
    {
        Self::Derived(Arc::new(f))
    }
}

impl fmt::Debug for KeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal => f.write_str("Literal"),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// Mapping from key-field name to how its value is obtained.
#[derive(Debug, Clone, Default)]
pub struct KeySpec {
    fields: BTreeMap<String, KeyField>,
}

impl KeySpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field copied verbatim from the event.
    pub fn literal(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), KeyField::Literal);
        self
    }

    /// Adds a field computed by `field`.
    pub fn field(mut self, name: impl Into<String>, field: KeyField) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Resolves this spec against an event into a flat grouping key.
    ///
    /// Fields whose source is absent (or whose derivation yields nothing)
    /// are left out of the key.
    pub fn extract(&self, event: &SourceEvent) -> GroupKey {
        let mut values = BTreeMap::new();
        for (name, field) in &self.fields {
            let value = match field {
                KeyField::Literal => event.get(name).cloned(),
                KeyField::Derived(derive) => derive(event).filter(|v| !v.is_null()),
            };
            if let Some(value) = value {
                values.insert(name.clone(), value);
            }
        }
        GroupKey::new(values)
    }
}

/// Flat, order-irrelevant grouping key that is part of a record's identity.
///
/// Equality, hashing and ordering use the canonical JSON encoding, so two
/// keys are equal exactly when every field is deep-equal.
#[derive(Clone)]
pub struct GroupKey {
    values: BTreeMap<String, Value>,
    canonical: String,
}

impl GroupKey {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        // BTreeMap keys and serde_json object keys both serialize sorted.
        let canonical = serde_json::to_string(&values).unwrap_or_default();
        Self { values, canonical }
    }

    /// Rebuilds a key from its canonical encoding.
    pub fn from_canonical(canonical: &str) -> serde_json::Result<Self> {
        let values: BTreeMap<String, Value> = serde_json::from_str(canonical)?;
        Ok(Self::new(values))
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for GroupKey {}

impl Hash for GroupKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for GroupKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl Serialize for GroupKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for GroupKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        BTreeMap::<String, Value>::deserialize(deserializer).map(Self::new)
    }
}
