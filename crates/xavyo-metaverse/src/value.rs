//! Typed attribute values.
//!
//! Objects store one [`AttributeEntry`] per value: a multi-valued attribute
//! with three members is three entries sharing an attribute id.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{ConnectedSystemId, ConnectedSystemObjectId, MetaverseObjectId};
use crate::schema::AttributeDataType;

/// Target of a reference-typed value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Reference {
    /// Another object in the same connected system.
    ConnectedSystemObject(ConnectedSystemObjectId),
    /// A metaverse object.
    MetaverseObject(MetaverseObjectId),
    /// Raw reference text the import could not resolve to an object.
    Unresolved(String),
}

impl Reference {
    /// Returns the referenced CSO, if this is a connected-system reference.
    #[must_use]
    pub fn connected_system_object(&self) -> Option<ConnectedSystemObjectId> {
        match self {
            Reference::ConnectedSystemObject(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns the referenced MVO, if this is a metaverse reference.
    #[must_use]
    pub fn metaverse_object(&self) -> Option<MetaverseObjectId> {
        match self {
            Reference::MetaverseObject(id) => Some(*id),
            _ => None,
        }
    }
}

/// A single typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Text(String),
    Number(i32),
    LongNumber(i64),
    Guid(Uuid),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Binary(Vec<u8>),
    Reference(Reference),
}

impl AttributeValue {
    /// The schema data type this value belongs to.
    #[must_use]
    pub fn data_type(&self) -> AttributeDataType {
        match self {
            AttributeValue::Text(_) => AttributeDataType::Text,
            AttributeValue::Number(_) => AttributeDataType::Number,
            AttributeValue::LongNumber(_) => AttributeDataType::LongNumber,
            AttributeValue::Guid(_) => AttributeDataType::Guid,
            AttributeValue::Boolean(_) => AttributeDataType::Boolean,
            AttributeValue::DateTime(_) => AttributeDataType::DateTime,
            AttributeValue::Binary(_) => AttributeDataType::Binary,
            AttributeValue::Reference(_) => AttributeDataType::Reference,
        }
    }

    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self, AttributeValue::Reference(_))
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            AttributeValue::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// Shorthand for a metaverse reference value.
    #[must_use]
    pub fn metaverse_reference(id: MetaverseObjectId) -> Self {
        AttributeValue::Reference(Reference::MetaverseObject(id))
    }

    /// Shorthand for a connected-system reference value.
    #[must_use]
    pub fn connected_system_reference(id: ConnectedSystemObjectId) -> Self {
        AttributeValue::Reference(Reference::ConnectedSystemObject(id))
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Text(s) => write!(f, "{s}"),
            AttributeValue::Number(n) => write!(f, "{n}"),
            AttributeValue::LongNumber(n) => write!(f, "{n}"),
            AttributeValue::Guid(g) => write!(f, "{g}"),
            AttributeValue::Boolean(b) => write!(f, "{b}"),
            AttributeValue::DateTime(d) => write!(f, "{}", d.to_rfc3339()),
            AttributeValue::Binary(bytes) => {
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            AttributeValue::Reference(Reference::ConnectedSystemObject(id)) => write!(f, "cso:{id}"),
            AttributeValue::Reference(Reference::MetaverseObject(id)) => write!(f, "mvo:{id}"),
            AttributeValue::Reference(Reference::Unresolved(raw)) => write!(f, "{raw}"),
        }
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Text(s)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Text(s.to_string())
    }
}

impl From<i32> for AttributeValue {
    fn from(n: i32) -> Self {
        AttributeValue::Number(n)
    }
}

impl From<i64> for AttributeValue {
    fn from(n: i64) -> Self {
        AttributeValue::LongNumber(n)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Boolean(b)
    }
}

impl From<Uuid> for AttributeValue {
    fn from(g: Uuid) -> Self {
        AttributeValue::Guid(g)
    }
}

impl From<DateTime<Utc>> for AttributeValue {
    fn from(d: DateTime<Utc>) -> Self {
        AttributeValue::DateTime(d)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(bytes: Vec<u8>) -> Self {
        AttributeValue::Binary(bytes)
    }
}

/// One value of one attribute on an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeEntry<A> {
    pub attribute_id: A,
    pub value: AttributeValue,
    /// Connected system that flowed this value into a metaverse object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributed_by: Option<ConnectedSystemId>,
}

impl<A> AttributeEntry<A> {
    pub fn new(attribute_id: A, value: impl Into<AttributeValue>) -> Self {
        Self {
            attribute_id,
            value: value.into(),
            contributed_by: None,
        }
    }

    /// Tag the entry with the connected system that contributed it.
    #[must_use]
    pub fn contributed_by(mut self, system: Option<ConnectedSystemId>) -> Self {
        self.contributed_by = system;
        self
    }
}

/// The value set of an object, keyed by attribute id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeValues<A> {
    entries: Vec<AttributeEntry<A>>,
}

impl<A> Default for AttributeValues<A> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<A: Copy + Eq + Hash> AttributeValues<A> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_entries(entries: Vec<AttributeEntry<A>>) -> Self {
        Self { entries }
    }

    /// Builder helper used heavily by tests and fixtures.
    #[must_use]
    pub fn with(mut self, attribute_id: A, value: impl Into<AttributeValue>) -> Self {
        self.add(attribute_id, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeEntry<A>> {
        self.entries.iter()
    }

    #[must_use]
    pub fn entries(&self) -> &[AttributeEntry<A>] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All values held for one attribute.
    pub fn values_of(&self, attribute_id: A) -> impl Iterator<Item = &AttributeValue> {
        self.entries
            .iter()
            .filter(move |e| e.attribute_id == attribute_id)
            .map(|e| &e.value)
    }

    pub fn entries_of(&self, attribute_id: A) -> impl Iterator<Item = &AttributeEntry<A>> {
        self.entries
            .iter()
            .filter(move |e| e.attribute_id == attribute_id)
    }

    #[must_use]
    pub fn first_value(&self, attribute_id: A) -> Option<&AttributeValue> {
        self.values_of(attribute_id).next()
    }

    #[must_use]
    pub fn has_values(&self, attribute_id: A) -> bool {
        self.entries.iter().any(|e| e.attribute_id == attribute_id)
    }

    #[must_use]
    pub fn contains(&self, attribute_id: A, value: &AttributeValue) -> bool {
        self.entries
            .iter()
            .any(|e| e.attribute_id == attribute_id && &e.value == value)
    }

    pub fn add(&mut self, attribute_id: A, value: impl Into<AttributeValue>) {
        self.entries.push(AttributeEntry::new(attribute_id, value));
    }

    pub fn push(&mut self, entry: AttributeEntry<A>) {
        self.entries.push(entry);
    }

    /// Remove one occurrence of a value. Returns whether anything was removed.
    pub fn remove_value(&mut self, attribute_id: A, value: &AttributeValue) -> bool {
        match self
            .entries
            .iter()
            .position(|e| e.attribute_id == attribute_id && &e.value == value)
        {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove every value of an attribute, returning what was removed.
    pub fn remove_all(&mut self, attribute_id: A) -> Vec<AttributeEntry<A>> {
        let (removed, kept) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.attribute_id == attribute_id);
        self.entries = kept;
        removed
    }

    /// Remove every value a given connected system contributed.
    pub fn remove_contributed_by(&mut self, system: ConnectedSystemId) -> Vec<AttributeEntry<A>> {
        let (removed, kept) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.contributed_by == Some(system));
        self.entries = kept;
        removed
    }

    /// Distinct attribute ids, in order of first appearance.
    #[must_use]
    pub fn attribute_ids(&self) -> Vec<A> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|e| seen.insert(e.attribute_id))
            .map(|e| e.attribute_id)
            .collect()
    }
}

impl<A> IntoIterator for AttributeValues<A> {
    type Item = AttributeEntry<A>;
    type IntoIter = std::vec::IntoIter<AttributeEntry<A>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<A> FromIterator<AttributeEntry<A>> for AttributeValues<A> {
    fn from_iter<T: IntoIterator<Item = AttributeEntry<A>>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
