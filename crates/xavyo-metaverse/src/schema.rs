//! Schema types for connected systems and the metaverse.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{
    ConnectedSystemAttributeId, ConnectedSystemId, ConnectedSystemObjectTypeId,
    MetaverseAttributeId, MetaverseObjectTypeId,
};

/// Data type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeDataType {
    Text,
    Number,
    LongNumber,
    Guid,
    Boolean,
    DateTime,
    Binary,
    Reference,
}

impl AttributeDataType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeDataType::Text => "text",
            AttributeDataType::Number => "number",
            AttributeDataType::LongNumber => "long_number",
            AttributeDataType::Guid => "guid",
            AttributeDataType::Boolean => "boolean",
            AttributeDataType::DateTime => "date_time",
            AttributeDataType::Binary => "binary",
            AttributeDataType::Reference => "reference",
        }
    }
}

impl std::fmt::Display for AttributeDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AttributeDataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(AttributeDataType::Text),
            "number" => Ok(AttributeDataType::Number),
            "long_number" => Ok(AttributeDataType::LongNumber),
            "guid" => Ok(AttributeDataType::Guid),
            "boolean" => Ok(AttributeDataType::Boolean),
            "date_time" => Ok(AttributeDataType::DateTime),
            "binary" => Ok(AttributeDataType::Binary),
            "reference" => Ok(AttributeDataType::Reference),
            _ => Err(format!("Unknown attribute data type: {s}")),
        }
    }
}

/// Whether an attribute holds one value or many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributePlurality {
    #[default]
    SingleValued,
    MultiValued,
}

/// An attribute definition in a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaAttribute<A> {
    pub id: A,
    pub name: String,
    pub data_type: AttributeDataType,
    #[serde(default)]
    pub plurality: AttributePlurality,
}

impl<A> SchemaAttribute<A> {
    pub fn single(id: A, name: impl Into<String>, data_type: AttributeDataType) -> Self {
        Self {
            id,
            name: name.into(),
            data_type,
            plurality: AttributePlurality::SingleValued,
        }
    }

    pub fn multi(id: A, name: impl Into<String>, data_type: AttributeDataType) -> Self {
        Self {
            id,
            name: name.into(),
            data_type,
            plurality: AttributePlurality::MultiValued,
        }
    }

    #[must_use]
    pub fn is_multi_valued(&self) -> bool {
        self.plurality == AttributePlurality::MultiValued
    }

    #[must_use]
    pub fn is_reference(&self) -> bool {
        self.data_type == AttributeDataType::Reference
    }
}

pub type ConnectedSystemAttribute = SchemaAttribute<ConnectedSystemAttributeId>;
pub type MetaverseAttribute = SchemaAttribute<MetaverseAttributeId>;

/// An object type in a connected system's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedSystemObjectType {
    pub id: ConnectedSystemObjectTypeId,
    pub name: String,
    pub attributes: Vec<ConnectedSystemAttribute>,
    /// Attribute that identifies objects of this type in the external system.
    #[serde(default)]
    pub external_id_attribute_id: Option<ConnectedSystemAttributeId>,
    /// Strip the values this system contributed to the joined MVO when one of
    /// its objects is disconnected.
    #[serde(default)]
    pub remove_contributed_attributes_on_obsoletion: bool,
}

impl ConnectedSystemObjectType {
    #[must_use]
    pub fn attribute(&self, id: ConnectedSystemAttributeId) -> Option<&ConnectedSystemAttribute> {
        self.attributes.iter().find(|a| a.id == id)
    }
}

/// A connected system and its schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedSystem {
    pub id: ConnectedSystemId,
    pub name: String,
    pub object_types: Vec<ConnectedSystemObjectType>,
    /// Watermark of the last successful delta synchronization.
    #[serde(default)]
    pub last_delta_sync_completed_at: Option<DateTime<Utc>>,
}

impl ConnectedSystem {
    #[must_use]
    pub fn object_type(&self, id: ConnectedSystemObjectTypeId) -> Option<&ConnectedSystemObjectType> {
        self.object_types.iter().find(|t| t.id == id)
    }

    /// Look up an attribute across all object types of this system.
    #[must_use]
    pub fn attribute(&self, id: ConnectedSystemAttributeId) -> Option<&ConnectedSystemAttribute> {
        self.object_types.iter().find_map(|t| t.attribute(id))
    }
}

/// When a metaverse object becomes eligible for automatic deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionRule {
    /// Never deleted automatically.
    #[default]
    Manual,
    /// Eligible once no connector remains joined.
    WhenLastConnectorDisconnected,
    /// Eligible as soon as one of the configured authoritative systems disconnects.
    WhenAuthoritativeSourceDisconnected,
}

impl DeletionRule {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionRule::Manual => "manual",
            DeletionRule::WhenLastConnectorDisconnected => "when_last_connector_disconnected",
            DeletionRule::WhenAuthoritativeSourceDisconnected => {
                "when_authoritative_source_disconnected"
            }
        }
    }
}

impl std::fmt::Display for DeletionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeletionRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(DeletionRule::Manual),
            "when_last_connector_disconnected" => Ok(DeletionRule::WhenLastConnectorDisconnected),
            "when_authoritative_source_disconnected" => {
                Ok(DeletionRule::WhenAuthoritativeSourceDisconnected)
            }
            _ => Err(format!("Unknown deletion rule: {s}")),
        }
    }
}

/// A metaverse object type and its lifecycle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaverseObjectType {
    pub id: MetaverseObjectTypeId,
    pub name: String,
    pub attributes: Vec<MetaverseAttribute>,
    #[serde(default)]
    pub deletion_rule: DeletionRule,
    /// `None` or zero means eligible objects are deleted within the same run.
    #[serde(default)]
    pub deletion_grace_period: Option<Duration>,
    /// Authoritative systems for `WhenAuthoritativeSourceDisconnected`.
    #[serde(default)]
    pub deletion_trigger_connected_system_ids: Vec<ConnectedSystemId>,
}

impl MetaverseObjectType {
    #[must_use]
    pub fn attribute(&self, id: MetaverseAttributeId) -> Option<&MetaverseAttribute> {
        self.attributes.iter().find(|a| a.id == id)
    }

    #[must_use]
    pub fn has_grace_period(&self) -> bool {
        self.deletion_grace_period.is_some_and(|d| !d.is_zero())
    }
}
