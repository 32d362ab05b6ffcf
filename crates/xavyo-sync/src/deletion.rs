//! Deletion rule evaluation on disconnect.

use chrono::{DateTime, Utc};
use xavyo_metaverse::{
    DeletionInitiator, DeletionRule, MetaverseObject, MetaverseObjectOrigin, MetaverseObjectType,
};

/// What should happen to a metaverse object after one of its connectors
/// disconnected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionDecision {
    /// Keep the object.
    NotEligible,
    /// Record the disconnect date; housekeeping deletes it after the grace period.
    MarkForDeletion {
        date: DateTime<Utc>,
        initiator: DeletionInitiator,
    },
    /// Delete at the current page's flush boundary.
    DeleteNow { initiator: DeletionInitiator },
}

impl DeletionDecision {
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        !matches!(self, DeletionDecision::NotEligible)
    }
}

/// Decide the fate of `mvo` after the connector described by `initiator`
/// disconnected, leaving `remaining_join_count` connectors joined.
///
/// An object already marked keeps its original date and initiator.
#[must_use]
pub fn on_disconnect(
    mvo: &MetaverseObject,
    mvo_type: &MetaverseObjectType,
    initiator: &DeletionInitiator,
    remaining_join_count: usize,
    now: DateTime<Utc>,
) -> DeletionDecision {
    if mvo.origin == MetaverseObjectOrigin::Internal {
        return DeletionDecision::NotEligible;
    }

    let eligible = match mvo_type.deletion_rule {
        DeletionRule::Manual => false,
        DeletionRule::WhenLastConnectorDisconnected => remaining_join_count == 0,
        DeletionRule::WhenAuthoritativeSourceDisconnected => {
            if mvo_type.deletion_trigger_connected_system_ids.is_empty() {
                remaining_join_count == 0
            } else {
                mvo_type
                    .deletion_trigger_connected_system_ids
                    .contains(&initiator.connected_system_id)
            }
        }
    };

    if !eligible {
        return DeletionDecision::NotEligible;
    }

    if !mvo_type.has_grace_period() {
        return DeletionDecision::DeleteNow {
            initiator: initiator.clone(),
        };
    }

    match (mvo.last_connector_disconnected_date, &mvo.deletion_initiated_by) {
        (Some(date), Some(existing)) => DeletionDecision::MarkForDeletion {
            date,
            initiator: existing.clone(),
        },
        (Some(date), None) => DeletionDecision::MarkForDeletion {
            date,
            initiator: initiator.clone(),
        },
        (None, _) => DeletionDecision::MarkForDeletion {
            date: now,
            initiator: initiator.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use xavyo_metaverse::{ConnectedSystemId, ConnectedSystemObjectId, MetaverseObjectTypeId};

    fn mvo_type(rule: DeletionRule, grace: Option<Duration>) -> MetaverseObjectType {
        MetaverseObjectType {
            id: MetaverseObjectTypeId::new(),
            name: "person".to_string(),
            attributes: Vec::new(),
            deletion_rule: rule,
            deletion_grace_period: grace,
            deletion_trigger_connected_system_ids: Vec::new(),
        }
    }

    fn initiator(system: ConnectedSystemId) -> DeletionInitiator {
        DeletionInitiator {
            connected_system_id: system,
            connected_system_object_id: ConnectedSystemObjectId::new(),
            activity_id: None,
        }
    }

    #[test]
    fn test_manual_never_eligible() {
        let t = mvo_type(DeletionRule::Manual, None);
        let mvo = MetaverseObject::project(t.id, Utc::now());
        let decision = on_disconnect(&mvo, &t, &initiator(ConnectedSystemId::new()), 0, Utc::now());
        assert_eq!(decision, DeletionDecision::NotEligible);
    }

    #[test]
    fn test_last_connector_requires_zero_remaining() {
        let t = mvo_type(DeletionRule::WhenLastConnectorDisconnected, None);
        let mvo = MetaverseObject::project(t.id, Utc::now());
        let who = initiator(ConnectedSystemId::new());

        assert!(!on_disconnect(&mvo, &t, &who, 1, Utc::now()).is_eligible());
        assert_eq!(
            on_disconnect(&mvo, &t, &who, 0, Utc::now()),
            DeletionDecision::DeleteNow { initiator: who }
        );
    }

    #[test]
    fn test_zero_grace_period_deletes_now() {
        let t = mvo_type(DeletionRule::WhenLastConnectorDisconnected, Some(Duration::ZERO));
        let mvo = MetaverseObject::project(t.id, Utc::now());
        let decision = on_disconnect(&mvo, &t, &initiator(ConnectedSystemId::new()), 0, Utc::now());
        assert!(matches!(decision, DeletionDecision::DeleteNow { .. }));
    }

    #[test]
    fn test_grace_period_marks() {
        let t = mvo_type(
            DeletionRule::WhenLastConnectorDisconnected,
            Some(Duration::from_secs(86_400)),
        );
        let mvo = MetaverseObject::project(t.id, Utc::now());
        let now = Utc::now();
        let who = initiator(ConnectedSystemId::new());
        assert_eq!(
            on_disconnect(&mvo, &t, &who, 0, now),
            DeletionDecision::MarkForDeletion {
                date: now,
                initiator: who
            }
        );
    }

    #[test]
    fn test_existing_marker_keeps_original_date() {
        let t = mvo_type(
            DeletionRule::WhenLastConnectorDisconnected,
            Some(Duration::from_secs(86_400)),
        );
        let first = initiator(ConnectedSystemId::new());
        let earlier = Utc::now() - chrono::Duration::days(2);
        let mut mvo = MetaverseObject::project(t.id, earlier);
        mvo.mark_for_deletion(earlier, first.clone());

        let decision = on_disconnect(&mvo, &t, &initiator(ConnectedSystemId::new()), 0, Utc::now());
        assert_eq!(
            decision,
            DeletionDecision::MarkForDeletion {
                date: earlier,
                initiator: first
            }
        );
    }

    #[test]
    fn test_authoritative_source_ignores_remaining_joins() {
        let hr = ConnectedSystemId::new();
        let mut t = mvo_type(DeletionRule::WhenAuthoritativeSourceDisconnected, None);
        t.deletion_trigger_connected_system_ids = vec![hr];
        let mvo = MetaverseObject::project(t.id, Utc::now());

        assert!(on_disconnect(&mvo, &t, &initiator(hr), 3, Utc::now()).is_eligible());
        assert!(!on_disconnect(&mvo, &t, &initiator(ConnectedSystemId::new()), 0, Utc::now())
            .is_eligible());
    }

    #[test]
    fn test_authoritative_without_triggers_falls_back() {
        let t = mvo_type(DeletionRule::WhenAuthoritativeSourceDisconnected, None);
        let mvo = MetaverseObject::project(t.id, Utc::now());
        let who = initiator(ConnectedSystemId::new());
        assert!(!on_disconnect(&mvo, &t, &who, 1, Utc::now()).is_eligible());
        assert!(on_disconnect(&mvo, &t, &who, 0, Utc::now()).is_eligible());
    }

    #[test]
    fn test_internal_objects_never_deleted() {
        let t = mvo_type(DeletionRule::WhenLastConnectorDisconnected, None);
        let mvo = MetaverseObject::internal(t.id);
        let decision = on_disconnect(&mvo, &t, &initiator(ConnectedSystemId::new()), 0, Utc::now());
        assert_eq!(decision, DeletionDecision::NotEligible);
    }
}
