//! Pending exports: staged outbound changes for a connected system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{
    ConnectedSystemAttributeId, ConnectedSystemId, ConnectedSystemObjectId, MetaverseObjectId,
    PendingExportId,
};
use crate::value::{AttributeValue, AttributeValues};

/// Kind of object-level change an export performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingExportChangeType {
    Create,
    Update,
    Delete,
}

impl PendingExportChangeType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingExportChangeType::Create => "create",
            PendingExportChangeType::Update => "update",
            PendingExportChangeType::Delete => "delete",
        }
    }
}

impl std::fmt::Display for PendingExportChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PendingExportChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(PendingExportChangeType::Create),
            "update" => Ok(PendingExportChangeType::Update),
            "delete" => Ok(PendingExportChangeType::Delete),
            _ => Err(format!("Unknown pending export change type: {s}")),
        }
    }
}

/// Execution status of a pending export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingExportStatus {
    /// Not executed yet.
    #[default]
    Pending,
    /// Executed; awaiting confirmation by the next import.
    Exported,
    /// Executed, but the next import did not show the change.
    ExportNotConfirmed,
}

impl PendingExportStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingExportStatus::Pending => "pending",
            PendingExportStatus::Exported => "exported",
            PendingExportStatus::ExportNotConfirmed => "export_not_confirmed",
        }
    }
}

impl std::fmt::Display for PendingExportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PendingExportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(PendingExportStatus::Pending),
            "exported" => Ok(PendingExportStatus::Exported),
            "export_not_confirmed" => Ok(PendingExportStatus::ExportNotConfirmed),
            _ => Err(format!("Unknown pending export status: {s}")),
        }
    }
}

/// Kind of attribute-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeChangeType {
    Add,
    Update,
    Remove,
    RemoveAll,
}

/// One attribute-level change inside a pending export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeValueChange {
    pub attribute_id: ConnectedSystemAttributeId,
    pub change_type: AttributeChangeType,
    #[serde(default)]
    pub value: Option<AttributeValue>,
}

impl AttributeValueChange {
    #[must_use]
    pub fn add(attribute_id: ConnectedSystemAttributeId, value: AttributeValue) -> Self {
        Self {
            attribute_id,
            change_type: AttributeChangeType::Add,
            value: Some(value),
        }
    }

    #[must_use]
    pub fn update(attribute_id: ConnectedSystemAttributeId, value: AttributeValue) -> Self {
        Self {
            attribute_id,
            change_type: AttributeChangeType::Update,
            value: Some(value),
        }
    }

    #[must_use]
    pub fn remove(attribute_id: ConnectedSystemAttributeId, value: AttributeValue) -> Self {
        Self {
            attribute_id,
            change_type: AttributeChangeType::Remove,
            value: Some(value),
        }
    }

    #[must_use]
    pub fn remove_all(attribute_id: ConnectedSystemAttributeId) -> Self {
        Self {
            attribute_id,
            change_type: AttributeChangeType::RemoveAll,
            value: None,
        }
    }

    /// Whether imported values show this change as applied.
    #[must_use]
    pub fn is_confirmed_by(&self, values: &AttributeValues<ConnectedSystemAttributeId>) -> bool {
        match (self.change_type, &self.value) {
            (AttributeChangeType::Add | AttributeChangeType::Update, Some(value)) => {
                values.contains(self.attribute_id, value)
            }
            (AttributeChangeType::Remove, Some(value)) => !values.contains(self.attribute_id, value),
            (AttributeChangeType::RemoveAll, _) => !values.has_values(self.attribute_id),
            // A valueless add/update/remove asserts absence.
            (_, None) => !values.has_values(self.attribute_id),
        }
    }
}

/// A staged outbound change destined for one connected system object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingExport {
    pub id: PendingExportId,
    pub connected_system_id: ConnectedSystemId,
    pub connected_system_object_id: ConnectedSystemObjectId,
    pub change_type: PendingExportChangeType,
    pub status: PendingExportStatus,
    pub attribute_value_changes: Vec<AttributeValueChange>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub source_metaverse_object_id: Option<MetaverseObjectId>,
    pub created_at: DateTime<Utc>,
}

impl PendingExport {
    #[must_use]
    pub fn new(
        connected_system_id: ConnectedSystemId,
        connected_system_object_id: ConnectedSystemObjectId,
        change_type: PendingExportChangeType,
    ) -> Self {
        Self {
            id: PendingExportId::new(),
            connected_system_id,
            connected_system_object_id,
            change_type,
            status: PendingExportStatus::Pending,
            attribute_value_changes: Vec::new(),
            error_count: 0,
            source_metaverse_object_id: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_changes(mut self, changes: Vec<AttributeValueChange>) -> Self {
        self.attribute_value_changes = changes;
        self
    }

    #[must_use]
    pub fn with_source(mut self, mvo_id: MetaverseObjectId) -> Self {
        self.source_metaverse_object_id = Some(mvo_id);
        self
    }

    /// Not yet executed, so it can still absorb new changes.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == PendingExportStatus::Pending
    }

    /// Fold newer changes into this export. Changes for an attribute that the
    /// newer set mentions are replaced wholesale.
    pub fn merge_changes(&mut self, changes: Vec<AttributeValueChange>) {
        let touched: Vec<ConnectedSystemAttributeId> =
            changes.iter().map(|c| c.attribute_id).collect();
        self.attribute_value_changes
            .retain(|c| !touched.contains(&c.attribute_id));
        self.attribute_value_changes.extend(changes);
    }

    /// Replace the values a `Create` export adds for one attribute. An empty
    /// set drops the attribute from the export. Returns whether it changed.
    pub fn replace_added_values(
        &mut self,
        attribute_id: ConnectedSystemAttributeId,
        values: Vec<AttributeValue>,
    ) -> bool {
        let current: Vec<&AttributeValue> = self
            .attribute_value_changes
            .iter()
            .filter(|c| c.attribute_id == attribute_id)
            .filter_map(|c| c.value.as_ref())
            .collect();
        if current.len() == values.len() && values.iter().all(|v| current.contains(&v)) {
            return false;
        }
        self.attribute_value_changes
            .retain(|c| c.attribute_id != attribute_id);
        self.attribute_value_changes.extend(
            values
                .into_iter()
                .map(|v| AttributeValueChange::add(attribute_id, v)),
        );
        true
    }

    /// Split changes into confirmed and unconfirmed against imported values.
    #[must_use]
    pub fn partition_confirmed(
        &self,
        values: &AttributeValues<ConnectedSystemAttributeId>,
    ) -> (Vec<AttributeValueChange>, Vec<AttributeValueChange>) {
        self.attribute_value_changes
            .iter()
            .cloned()
            .partition(|c| c.is_confirmed_by(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            PendingExportStatus::Pending,
            PendingExportStatus::Exported,
            PendingExportStatus::ExportNotConfirmed,
        ] {
            let parsed: PendingExportStatus = status.as_str().parse().unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_change_confirmation() {
        let mail = ConnectedSystemAttributeId::new();
        let values = AttributeValues::new().with(mail, "a@example.com");

        assert!(AttributeValueChange::add(mail, "a@example.com".into()).is_confirmed_by(&values));
        assert!(!AttributeValueChange::add(mail, "b@example.com".into()).is_confirmed_by(&values));
        assert!(AttributeValueChange::remove(mail, "b@example.com".into()).is_confirmed_by(&values));
        assert!(!AttributeValueChange::remove_all(mail).is_confirmed_by(&values));
    }

    #[test]
    fn test_merge_replaces_changes_for_same_attribute() {
        let mail = ConnectedSystemAttributeId::new();
        let name = ConnectedSystemAttributeId::new();
        let mut export = PendingExport::new(
            ConnectedSystemId::new(),
            ConnectedSystemObjectId::new(),
            PendingExportChangeType::Update,
        )
        .with_changes(vec![
            AttributeValueChange::update(mail, "old@example.com".into()),
            AttributeValueChange::update(name, "Ada".into()),
        ]);

        export.merge_changes(vec![AttributeValueChange::update(mail, "new@example.com".into())]);

        assert_eq!(export.attribute_value_changes.len(), 2);
        assert!(export
            .attribute_value_changes
            .contains(&AttributeValueChange::update(mail, "new@example.com".into())));
        assert!(!export
            .attribute_value_changes
            .contains(&AttributeValueChange::update(mail, "old@example.com".into())));
    }

    #[test]
    fn test_replace_added_values_on_create() {
        let account = ConnectedSystemAttributeId::new();
        let name = ConnectedSystemAttributeId::new();
        let mut export = PendingExport::new(
            ConnectedSystemId::new(),
            ConnectedSystemObjectId::new(),
            PendingExportChangeType::Create,
        )
        .with_changes(vec![
            AttributeValueChange::add(account, "E1".into()),
            AttributeValueChange::add(name, "Ada".into()),
        ]);

        assert!(!export.replace_added_values(name, vec!["Ada".into()]));
        assert!(export.replace_added_values(name, vec!["Ada King".into()]));
        assert_eq!(export.attribute_value_changes.len(), 2);
        assert!(export
            .attribute_value_changes
            .contains(&AttributeValueChange::add(name, "Ada King".into())));

        assert!(export.replace_added_values(name, Vec::new()));
        assert_eq!(
            export.attribute_value_changes,
            vec![AttributeValueChange::add(account, "E1".into())]
        );
    }
}
