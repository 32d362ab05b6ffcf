//! Audit records produced by a synchronization run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{
    ActivityId, ConnectedSystemObjectId, ExecutionItemId, MetaverseAttributeId, MetaverseObjectId,
};
use crate::objects::AppliedChanges;
use crate::value::AttributeValue;

/// Outcome recorded for one object in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectChangeType {
    Added,
    Updated,
    Deleted,
    Joined,
    Projected,
    AttributeFlow,
    Disconnected,
    DisconnectedOutOfScope,
    DriftCorrection,
    PendingExportConfirmed,
    NoChange,
}

impl ObjectChangeType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectChangeType::Added => "added",
            ObjectChangeType::Updated => "updated",
            ObjectChangeType::Deleted => "deleted",
            ObjectChangeType::Joined => "joined",
            ObjectChangeType::Projected => "projected",
            ObjectChangeType::AttributeFlow => "attribute_flow",
            ObjectChangeType::Disconnected => "disconnected",
            ObjectChangeType::DisconnectedOutOfScope => "disconnected_out_of_scope",
            ObjectChangeType::DriftCorrection => "drift_correction",
            ObjectChangeType::PendingExportConfirmed => "pending_export_confirmed",
            ObjectChangeType::NoChange => "no_change",
        }
    }
}

impl std::fmt::Display for ObjectChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ObjectChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "added" => Ok(ObjectChangeType::Added),
            "updated" => Ok(ObjectChangeType::Updated),
            "deleted" => Ok(ObjectChangeType::Deleted),
            "joined" => Ok(ObjectChangeType::Joined),
            "projected" => Ok(ObjectChangeType::Projected),
            "attribute_flow" => Ok(ObjectChangeType::AttributeFlow),
            "disconnected" => Ok(ObjectChangeType::Disconnected),
            "disconnected_out_of_scope" => Ok(ObjectChangeType::DisconnectedOutOfScope),
            "drift_correction" => Ok(ObjectChangeType::DriftCorrection),
            "pending_export_confirmed" => Ok(ObjectChangeType::PendingExportConfirmed),
            "no_change" => Ok(ObjectChangeType::NoChange),
            _ => Err(format!("Unknown object change type: {s}")),
        }
    }
}

/// Per-object failure recorded on an execution item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorType {
    AmbiguousMatch,
    CouldNotJoinDueToExistingJoin,
    UnresolvedReference,
    UnhandledError,
}

impl ExecutionErrorType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionErrorType::AmbiguousMatch => "ambiguous_match",
            ExecutionErrorType::CouldNotJoinDueToExistingJoin => {
                "could_not_join_due_to_existing_join"
            }
            ExecutionErrorType::UnresolvedReference => "unresolved_reference",
            ExecutionErrorType::UnhandledError => "unhandled_error",
        }
    }
}

impl std::fmt::Display for ExecutionErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionErrorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ambiguous_match" => Ok(ExecutionErrorType::AmbiguousMatch),
            "could_not_join_due_to_existing_join" => {
                Ok(ExecutionErrorType::CouldNotJoinDueToExistingJoin)
            }
            "unresolved_reference" => Ok(ExecutionErrorType::UnresolvedReference),
            "unhandled_error" => Ok(ExecutionErrorType::UnhandledError),
            _ => Err(format!("Unknown execution error type: {s}")),
        }
    }
}

/// Audit record of one object outcome during one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionItem {
    pub id: ExecutionItemId,
    pub activity_id: ActivityId,
    pub connected_system_object_id: Option<ConnectedSystemObjectId>,
    #[serde(default)]
    pub metaverse_object_id: Option<MetaverseObjectId>,
    pub object_change_type: ObjectChangeType,
    #[serde(default)]
    pub error_type: Option<ExecutionErrorType>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub attribute_flow_count: usize,
    pub created_at: DateTime<Utc>,
}

impl ExecutionItem {
    #[must_use]
    pub fn new(
        activity_id: ActivityId,
        connected_system_object_id: Option<ConnectedSystemObjectId>,
        object_change_type: ObjectChangeType,
    ) -> Self {
        Self {
            id: ExecutionItemId::new(),
            activity_id,
            connected_system_object_id,
            metaverse_object_id: None,
            object_change_type,
            error_type: None,
            error_message: None,
            attribute_flow_count: 0,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_metaverse_object(mut self, mvo_id: MetaverseObjectId) -> Self {
        self.metaverse_object_id = Some(mvo_id);
        self
    }

    #[must_use]
    pub fn with_attribute_flow_count(mut self, count: usize) -> Self {
        self.attribute_flow_count = count;
        self
    }

    #[must_use]
    pub fn with_error(mut self, error_type: ExecutionErrorType, message: impl Into<String>) -> Self {
        self.error_type = Some(error_type);
        self.error_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error_type.is_some()
    }
}

/// Kind of metaverse object mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaverseChangeKind {
    Created,
    Updated,
    Deleted,
}

impl MetaverseChangeKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaverseChangeKind::Created => "created",
            MetaverseChangeKind::Updated => "updated",
            MetaverseChangeKind::Deleted => "deleted",
        }
    }
}

/// Values added to and removed from one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaverseAttributeChange {
    pub attribute_id: MetaverseAttributeId,
    pub added: Vec<AttributeValue>,
    pub removed: Vec<AttributeValue>,
}

/// Append-only audit record of a metaverse object mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaverseObjectChange {
    pub id: Uuid,
    pub metaverse_object_id: MetaverseObjectId,
    pub kind: MetaverseChangeKind,
    pub attribute_changes: Vec<MetaverseAttributeChange>,
    #[serde(default)]
    pub initiated_by: Option<ConnectedSystemObjectId>,
    #[serde(default)]
    pub activity_id: Option<ActivityId>,
    pub created_at: DateTime<Utc>,
}

impl MetaverseObjectChange {
    /// Build an audit record from the deltas merged into an object.
    #[must_use]
    pub fn from_applied(
        metaverse_object_id: MetaverseObjectId,
        kind: MetaverseChangeKind,
        applied: &AppliedChanges,
        now: DateTime<Utc>,
    ) -> Self {
        let attribute_changes = applied
            .changed_attributes
            .iter()
            .map(|attr| MetaverseAttributeChange {
                attribute_id: *attr,
                added: applied
                    .added
                    .iter()
                    .filter(|e| e.attribute_id == *attr)
                    .map(|e| e.value.clone())
                    .collect(),
                removed: applied
                    .removed
                    .iter()
                    .filter(|e| e.attribute_id == *attr)
                    .map(|e| e.value.clone())
                    .collect(),
            })
            .collect();

        Self {
            id: Uuid::new_v4(),
            metaverse_object_id,
            kind,
            attribute_changes,
            initiated_by: None,
            activity_id: None,
            created_at: now,
        }
    }

    /// Record of a deletion; carries no attribute detail.
    #[must_use]
    pub fn deleted(metaverse_object_id: MetaverseObjectId, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            metaverse_object_id,
            kind: MetaverseChangeKind::Deleted,
            attribute_changes: Vec::new(),
            initiated_by: None,
            activity_id: None,
            created_at: now,
        }
    }

    #[must_use]
    pub fn initiated_by(
        mut self,
        cso_id: Option<ConnectedSystemObjectId>,
        activity_id: ActivityId,
    ) -> Self {
        self.initiated_by = cso_id;
        self.activity_id = Some(activity_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::AttributeEntry;

    #[test]
    fn test_change_type_roundtrip() {
        for change in [
            ObjectChangeType::Added,
            ObjectChangeType::Projected,
            ObjectChangeType::DisconnectedOutOfScope,
            ObjectChangeType::PendingExportConfirmed,
            ObjectChangeType::NoChange,
        ] {
            let parsed: ObjectChangeType = change.as_str().parse().unwrap();
            assert_eq!(change, parsed);
        }
    }

    #[test]
    fn test_error_type_roundtrip() {
        let parsed: ExecutionErrorType = "could_not_join_due_to_existing_join".parse().unwrap();
        assert_eq!(parsed, ExecutionErrorType::CouldNotJoinDueToExistingJoin);
    }

    #[test]
    fn test_execution_item_builder() {
        let item = ExecutionItem::new(
            ActivityId::new(),
            Some(ConnectedSystemObjectId::new()),
            ObjectChangeType::Joined,
        )
        .with_error(ExecutionErrorType::AmbiguousMatch, "2 candidates");
        assert!(item.is_error());
        assert_eq!(item.error_message.as_deref(), Some("2 candidates"));
    }

    #[test]
    fn test_change_record_groups_by_attribute() {
        let name = MetaverseAttributeId::new();
        let applied = AppliedChanges {
            added: vec![AttributeEntry::new(name, "New")],
            removed: vec![AttributeEntry::new(name, "Old")],
            changed_attributes: vec![name],
            emptied_attributes: vec![],
        };
        let change = MetaverseObjectChange::from_applied(
            MetaverseObjectId::new(),
            MetaverseChangeKind::Updated,
            &applied,
            Utc::now(),
        );
        assert_eq!(change.attribute_changes.len(), 1);
        assert_eq!(change.attribute_changes[0].added, vec!["New".into()]);
        assert_eq!(change.attribute_changes[0].removed, vec!["Old".into()]);
    }
}
