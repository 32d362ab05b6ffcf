//! Connected system objects and metaverse objects.
//!
//! A connected system object (CSO) is the staged mirror of one object in an
//! external system. A metaverse object (MVO) is the reconciled identity the
//! CSOs of many systems join to. The two reference each other by id only;
//! an MVO's join set is whatever CSOs carry its id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{
    ActivityId, ConnectedSystemAttributeId, ConnectedSystemId, ConnectedSystemObjectId,
    ConnectedSystemObjectTypeId, MetaverseAttributeId, MetaverseObjectId, MetaverseObjectTypeId,
};
use crate::value::{AttributeEntry, AttributeValue, AttributeValues};

pub type CsoAttributeEntry = AttributeEntry<ConnectedSystemAttributeId>;
pub type MvoAttributeEntry = AttributeEntry<MetaverseAttributeId>;

/// Lifecycle status of a connected system object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectedSystemObjectStatus {
    /// Present in the connected system.
    #[default]
    Normal,
    /// No longer present in the connected system; awaiting teardown.
    Obsolete,
    /// Created by export evaluation, not yet exported.
    PendingProvisioning,
}

impl ConnectedSystemObjectStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectedSystemObjectStatus::Normal => "normal",
            ConnectedSystemObjectStatus::Obsolete => "obsolete",
            ConnectedSystemObjectStatus::PendingProvisioning => "pending_provisioning",
        }
    }
}

impl std::fmt::Display for ConnectedSystemObjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConnectedSystemObjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(ConnectedSystemObjectStatus::Normal),
            "obsolete" => Ok(ConnectedSystemObjectStatus::Obsolete),
            "pending_provisioning" => Ok(ConnectedSystemObjectStatus::PendingProvisioning),
            _ => Err(format!("Unknown connected system object status: {s}")),
        }
    }
}

/// How a connected system object came to be joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    #[default]
    NotJoined,
    /// Matched an existing metaverse object.
    Joined,
    /// Created a new metaverse object.
    Projected,
    /// Joined by an administrator.
    Explicit,
    /// Created by export evaluation for an existing metaverse object.
    Provisioned,
}

impl JoinType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinType::NotJoined => "not_joined",
            JoinType::Joined => "joined",
            JoinType::Projected => "projected",
            JoinType::Explicit => "explicit",
            JoinType::Provisioned => "provisioned",
        }
    }
}

impl std::fmt::Display for JoinType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JoinType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "not_joined" => Ok(JoinType::NotJoined),
            "joined" => Ok(JoinType::Joined),
            "projected" => Ok(JoinType::Projected),
            "explicit" => Ok(JoinType::Explicit),
            "provisioned" => Ok(JoinType::Provisioned),
            _ => Err(format!("Unknown join type: {s}")),
        }
    }
}

/// Staged mirror of one object in a connected system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedSystemObject {
    pub id: ConnectedSystemObjectId,
    pub connected_system_id: ConnectedSystemId,
    pub type_id: ConnectedSystemObjectTypeId,
    pub external_id_attribute_id: ConnectedSystemAttributeId,
    #[serde(default)]
    pub secondary_external_id_attribute_id: Option<ConnectedSystemAttributeId>,
    pub status: ConnectedSystemObjectStatus,
    pub join_type: JoinType,
    pub metaverse_object_id: Option<MetaverseObjectId>,
    #[serde(default)]
    pub date_joined: Option<DateTime<Utc>>,
    pub attribute_values: AttributeValues<ConnectedSystemAttributeId>,
    /// Values imported but not yet merged into `attribute_values`.
    #[serde(default)]
    pub pending_attribute_value_additions: Vec<CsoAttributeEntry>,
    #[serde(default)]
    pub pending_attribute_value_removals: Vec<CsoAttributeEntry>,
    pub created_at: DateTime<Utc>,
    /// Last time an import changed this object. Drives delta synchronization.
    pub last_updated: DateTime<Utc>,
}

impl ConnectedSystemObject {
    /// Create an unjoined, normal object with no values.
    #[must_use]
    pub fn new(
        connected_system_id: ConnectedSystemId,
        type_id: ConnectedSystemObjectTypeId,
        external_id_attribute_id: ConnectedSystemAttributeId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ConnectedSystemObjectId::new(),
            connected_system_id,
            type_id,
            external_id_attribute_id,
            secondary_external_id_attribute_id: None,
            status: ConnectedSystemObjectStatus::Normal,
            join_type: JoinType::NotJoined,
            metaverse_object_id: None,
            date_joined: None,
            attribute_values: AttributeValues::new(),
            pending_attribute_value_additions: Vec::new(),
            pending_attribute_value_removals: Vec::new(),
            created_at: now,
            last_updated: now,
        }
    }

    #[must_use]
    pub fn with_value(
        mut self,
        attribute_id: ConnectedSystemAttributeId,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attribute_values.add(attribute_id, value);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: ConnectedSystemObjectStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.metaverse_object_id.is_some()
    }

    #[must_use]
    pub fn is_obsolete(&self) -> bool {
        self.status == ConnectedSystemObjectStatus::Obsolete
    }

    #[must_use]
    pub fn external_id(&self) -> Option<&AttributeValue> {
        self.attribute_values.first_value(self.external_id_attribute_id)
    }

    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.pending_attribute_value_additions.is_empty()
            || !self.pending_attribute_value_removals.is_empty()
    }

    /// Current values of one attribute with staged import deltas applied.
    #[must_use]
    pub fn effective_values(&self, attribute_id: ConnectedSystemAttributeId) -> Vec<AttributeValue> {
        let mut values: Vec<AttributeValue> =
            self.attribute_values.values_of(attribute_id).cloned().collect();
        for removal in self
            .pending_attribute_value_removals
            .iter()
            .filter(|e| e.attribute_id == attribute_id)
        {
            if let Some(index) = values.iter().position(|v| v == &removal.value) {
                values.remove(index);
            }
        }
        values.extend(
            self.pending_attribute_value_additions
                .iter()
                .filter(|e| e.attribute_id == attribute_id)
                .map(|e| e.value.clone()),
        );
        values
    }

    /// The complete value set with staged import deltas applied.
    #[must_use]
    pub fn effective_attribute_values(&self) -> AttributeValues<ConnectedSystemAttributeId> {
        if !self.has_pending_changes() {
            return self.attribute_values.clone();
        }
        let mut values = self.attribute_values.clone();
        for removal in &self.pending_attribute_value_removals {
            values.remove_value(removal.attribute_id, &removal.value);
        }
        for addition in &self.pending_attribute_value_additions {
            values.push(addition.clone());
        }
        values
    }

    /// Merge staged import deltas into the value set.
    pub fn commit_pending_changes(&mut self) -> bool {
        if !self.has_pending_changes() {
            return false;
        }
        self.attribute_values = self.effective_attribute_values();
        self.pending_attribute_value_additions.clear();
        self.pending_attribute_value_removals.clear();
        true
    }

    /// Record a join to a metaverse object.
    pub fn join_to(&mut self, mvo_id: MetaverseObjectId, join_type: JoinType, now: DateTime<Utc>) {
        self.metaverse_object_id = Some(mvo_id);
        self.join_type = join_type;
        self.date_joined = Some(now);
    }

    /// Break the join. Returns the metaverse object it was joined to.
    pub fn disconnect(&mut self) -> Option<MetaverseObjectId> {
        self.join_type = JoinType::NotJoined;
        self.date_joined = None;
        self.metaverse_object_id.take()
    }
}

/// Where a metaverse object came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaverseObjectOrigin {
    /// Created inside the platform (built-in accounts). Never auto-deleted.
    Internal,
    /// Created by projection from a connected system object.
    #[default]
    Projected,
}

impl MetaverseObjectOrigin {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaverseObjectOrigin::Internal => "internal",
            MetaverseObjectOrigin::Projected => "projected",
        }
    }
}

impl std::str::FromStr for MetaverseObjectOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "internal" => Ok(MetaverseObjectOrigin::Internal),
            "projected" => Ok(MetaverseObjectOrigin::Projected),
            _ => Err(format!("Unknown metaverse object origin: {s}")),
        }
    }
}

/// What caused a metaverse object to become eligible for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionInitiator {
    pub connected_system_id: ConnectedSystemId,
    pub connected_system_object_id: ConnectedSystemObjectId,
    #[serde(default)]
    pub activity_id: Option<ActivityId>,
}

/// Result of merging staged deltas into a metaverse object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedChanges {
    pub added: Vec<MvoAttributeEntry>,
    pub removed: Vec<MvoAttributeEntry>,
    /// Attributes whose value set changed.
    pub changed_attributes: Vec<MetaverseAttributeId>,
    /// Attributes left with no values at all.
    pub emptied_attributes: Vec<MetaverseAttributeId>,
}

impl AppliedChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Number of attribute values touched.
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

/// The reconciled identity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaverseObject {
    pub id: MetaverseObjectId,
    pub type_id: MetaverseObjectTypeId,
    pub origin: MetaverseObjectOrigin,
    pub attribute_values: AttributeValues<MetaverseAttributeId>,
    #[serde(default)]
    pub pending_attribute_value_additions: Vec<MvoAttributeEntry>,
    #[serde(default)]
    pub pending_attribute_value_removals: Vec<MvoAttributeEntry>,
    #[serde(default)]
    pub last_connector_disconnected_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deletion_initiated_by: Option<DeletionInitiator>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MetaverseObject {
    /// Create a new projected object. Its id is assigned now, but it only
    /// becomes visible to storage when the owning batch is flushed.
    #[must_use]
    pub fn project(type_id: MetaverseObjectTypeId, now: DateTime<Utc>) -> Self {
        Self {
            id: MetaverseObjectId::new(),
            type_id,
            origin: MetaverseObjectOrigin::Projected,
            attribute_values: AttributeValues::new(),
            pending_attribute_value_additions: Vec::new(),
            pending_attribute_value_removals: Vec::new(),
            last_connector_disconnected_date: None,
            deletion_initiated_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create an internal object (built-in accounts and the like).
    #[must_use]
    pub fn internal(type_id: MetaverseObjectTypeId) -> Self {
        let mut mvo = Self::project(type_id, Utc::now());
        mvo.origin = MetaverseObjectOrigin::Internal;
        mvo
    }

    #[must_use]
    pub fn with_value(
        mut self,
        attribute_id: MetaverseAttributeId,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attribute_values.add(attribute_id, value);
        self
    }

    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.pending_attribute_value_additions.is_empty()
            || !self.pending_attribute_value_removals.is_empty()
    }

    /// Stage a value addition.
    pub fn stage_addition(&mut self, entry: MvoAttributeEntry) {
        self.pending_attribute_value_additions.push(entry);
    }

    /// Stage a value removal.
    pub fn stage_removal(&mut self, entry: MvoAttributeEntry) {
        self.pending_attribute_value_removals.push(entry);
    }

    /// Merge staged deltas into the value set: removals first, then additions.
    pub fn apply_pending_changes(&mut self, now: DateTime<Utc>) -> AppliedChanges {
        let mut applied = AppliedChanges::default();
        if !self.has_pending_changes() {
            return applied;
        }

        for removal in std::mem::take(&mut self.pending_attribute_value_removals) {
            if self
                .attribute_values
                .remove_value(removal.attribute_id, &removal.value)
            {
                applied.removed.push(removal);
            }
        }
        for addition in std::mem::take(&mut self.pending_attribute_value_additions) {
            self.attribute_values.push(addition.clone());
            applied.added.push(addition);
        }

        for entry in applied.added.iter().chain(applied.removed.iter()) {
            if !applied.changed_attributes.contains(&entry.attribute_id) {
                applied.changed_attributes.push(entry.attribute_id);
            }
        }
        applied.emptied_attributes = applied
            .changed_attributes
            .iter()
            .copied()
            .filter(|attr| !self.attribute_values.has_values(*attr))
            .collect();

        if !applied.is_empty() {
            self.updated_at = now;
        }
        applied
    }

    #[must_use]
    pub fn is_marked_for_deletion(&self) -> bool {
        self.last_connector_disconnected_date.is_some()
    }

    pub fn mark_for_deletion(&mut self, when: DateTime<Utc>, initiator: DeletionInitiator) {
        self.last_connector_disconnected_date = Some(when);
        self.deletion_initiated_by = Some(initiator);
        self.updated_at = when;
    }

    /// Clear a pending deletion marker. Returns whether one was set.
    pub fn clear_deletion_marker(&mut self) -> bool {
        let was_marked = self.is_marked_for_deletion();
        self.last_connector_disconnected_date = None;
        self.deletion_initiated_by = None;
        was_marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cso() -> ConnectedSystemObject {
        ConnectedSystemObject::new(
            ConnectedSystemId::new(),
            ConnectedSystemObjectTypeId::new(),
            ConnectedSystemAttributeId::new(),
        )
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            ConnectedSystemObjectStatus::Normal,
            ConnectedSystemObjectStatus::Obsolete,
            ConnectedSystemObjectStatus::PendingProvisioning,
        ] {
            let parsed: ConnectedSystemObjectStatus = status.as_str().parse().unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_join_type_roundtrip() {
        for join_type in [
            JoinType::NotJoined,
            JoinType::Joined,
            JoinType::Projected,
            JoinType::Explicit,
            JoinType::Provisioned,
        ] {
            let parsed: JoinType = join_type.as_str().parse().unwrap();
            assert_eq!(join_type, parsed);
        }
    }

    #[test]
    fn test_effective_values_apply_pending_deltas() {
        let attr = ConnectedSystemAttributeId::new();
        let mut object = cso().with_value(attr, "a").with_value(attr, "b");
        object
            .pending_attribute_value_removals
            .push(AttributeEntry::new(attr, "a"));
        object
            .pending_attribute_value_additions
            .push(AttributeEntry::new(attr, "c"));

        let values = object.effective_values(attr);
        assert_eq!(values, vec!["b".into(), "c".into()]);

        assert!(object.commit_pending_changes());
        assert!(!object.has_pending_changes());
        assert_eq!(object.attribute_values.values_of(attr).count(), 2);
        assert!(object.attribute_values.contains(attr, &"c".into()));
    }

    #[test]
    fn test_join_and_disconnect() {
        let mut object = cso();
        let mvo_id = MetaverseObjectId::new();
        object.join_to(mvo_id, JoinType::Joined, Utc::now());
        assert!(object.is_joined());
        assert!(object.date_joined.is_some());

        assert_eq!(object.disconnect(), Some(mvo_id));
        assert_eq!(object.join_type, JoinType::NotJoined);
        assert!(object.metaverse_object_id.is_none());
        assert!(object.date_joined.is_none());
    }

    #[test]
    fn test_apply_pending_changes_reports_changed_and_emptied() {
        let name = MetaverseAttributeId::new();
        let mail = MetaverseAttributeId::new();
        let mut mvo = MetaverseObject::project(MetaverseObjectTypeId::new(), Utc::now())
            .with_value(name, "Old")
            .with_value(mail, "old@example.com");

        mvo.stage_removal(AttributeEntry::new(name, "Old"));
        mvo.stage_addition(AttributeEntry::new(name, "New"));
        mvo.stage_removal(AttributeEntry::new(mail, "old@example.com"));

        let applied = mvo.apply_pending_changes(Utc::now());
        assert_eq!(applied.value_count(), 3);
        assert_eq!(applied.changed_attributes, vec![name, mail]);
        assert_eq!(applied.emptied_attributes, vec![mail]);
        assert!(!mvo.has_pending_changes());
        assert_eq!(mvo.attribute_values.first_value(name), Some(&"New".into()));
    }

    #[test]
    fn test_removal_of_absent_value_is_not_reported() {
        let attr = MetaverseAttributeId::new();
        let mut mvo = MetaverseObject::project(MetaverseObjectTypeId::new(), Utc::now());
        mvo.stage_removal(AttributeEntry::new(attr, "ghost"));

        let applied = mvo.apply_pending_changes(Utc::now());
        assert!(applied.is_empty());
    }

    #[test]
    fn test_deletion_marker() {
        let mut mvo = MetaverseObject::project(MetaverseObjectTypeId::new(), Utc::now());
        assert!(!mvo.clear_deletion_marker());

        mvo.mark_for_deletion(
            Utc::now(),
            DeletionInitiator {
                connected_system_id: ConnectedSystemId::new(),
                connected_system_object_id: ConnectedSystemObjectId::new(),
                activity_id: None,
            },
        );
        assert!(mvo.is_marked_for_deletion());
        assert!(mvo.clear_deletion_marker());
        assert!(mvo.deletion_initiated_by.is_none());
    }
}
