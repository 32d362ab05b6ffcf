//! Confirmation of executed pending exports against imported values.

use tracing::{debug, warn};
use xavyo_metaverse::{
    ConnectedSystemObject, PendingExport, PendingExportChangeType, PendingExportId,
    PendingExportStatus,
};

/// What confirmation decided for one object's exports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmationOutcome {
    /// Exports fully confirmed by the import; delete them.
    pub confirmed: Vec<PendingExportId>,
    /// Exports narrowed or flagged for retry; persist them.
    pub updated: Vec<PendingExport>,
}

impl ConfirmationOutcome {
    #[must_use]
    pub fn confirmed_count(&self) -> usize {
        self.confirmed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.updated.is_empty()
    }
}

/// Reconcile an object's exports with what the latest import shows.
///
/// Exports never executed (`Pending`) are left alone. A delete is confirmed
/// once the object is obsolete. Otherwise every attribute change must be
/// visible in the object's values: a partial match narrows the export to
/// the unconfirmed changes, no match retries the whole export, and both
/// increment the error count.
#[must_use]
pub fn confirm_pending_exports(
    cso: &ConnectedSystemObject,
    exports: &[PendingExport],
) -> ConfirmationOutcome {
    let mut outcome = ConfirmationOutcome::default();
    let values = cso.effective_attribute_values();

    for export in exports {
        if export.status == PendingExportStatus::Pending {
            continue;
        }

        if export.change_type == PendingExportChangeType::Delete {
            if cso.is_obsolete() {
                outcome.confirmed.push(export.id);
            } else {
                let mut retry = export.clone();
                retry.status = PendingExportStatus::ExportNotConfirmed;
                retry.error_count += 1;
                outcome.updated.push(retry);
            }
            continue;
        }

        let (confirmed, unconfirmed) = export.partition_confirmed(&values);
        if unconfirmed.is_empty() {
            debug!(export_id = %export.id, cso_id = %cso.id, "Pending export confirmed");
            outcome.confirmed.push(export.id);
            continue;
        }

        let mut retry = export.clone();
        retry.status = PendingExportStatus::ExportNotConfirmed;
        retry.error_count += 1;
        if !confirmed.is_empty() {
            retry.attribute_value_changes = unconfirmed;
        }
        warn!(
            export_id = %export.id,
            cso_id = %cso.id,
            confirmed = confirmed.len(),
            unconfirmed = retry.attribute_value_changes.len(),
            error_count = retry.error_count,
            "Pending export not confirmed"
        );
        outcome.updated.push(retry);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use xavyo_metaverse::{
        AttributeValueChange, ConnectedSystemAttributeId, ConnectedSystemId,
        ConnectedSystemObjectStatus, ConnectedSystemObjectTypeId,
    };

    struct Fixture {
        system: ConnectedSystemId,
        mail: ConnectedSystemAttributeId,
        phone: ConnectedSystemAttributeId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                system: ConnectedSystemId::new(),
                mail: ConnectedSystemAttributeId::new(),
                phone: ConnectedSystemAttributeId::new(),
            }
        }

        fn cso(&self) -> ConnectedSystemObject {
            ConnectedSystemObject::new(self.system, ConnectedSystemObjectTypeId::new(), self.mail)
                .with_value(self.mail, "a@example.com")
        }

        fn exported(&self, cso: &ConnectedSystemObject, changes: Vec<AttributeValueChange>) -> PendingExport {
            let mut export = PendingExport::new(self.system, cso.id, PendingExportChangeType::Update)
                .with_changes(changes);
            export.status = PendingExportStatus::Exported;
            export
        }
    }

    #[test]
    fn test_fully_confirmed_export_is_deleted() {
        let f = Fixture::new();
        let cso = f.cso();
        let export = f.exported(&cso, vec![AttributeValueChange::update(f.mail, "a@example.com".into())]);

        let outcome = confirm_pending_exports(&cso, &[export.clone()]);
        assert_eq!(outcome.confirmed, vec![export.id]);
        assert!(outcome.updated.is_empty());
    }

    #[test]
    fn test_partial_confirmation_narrows_export() {
        let f = Fixture::new();
        let cso = f.cso();
        let export = f.exported(
            &cso,
            vec![
                AttributeValueChange::update(f.mail, "a@example.com".into()),
                AttributeValueChange::update(f.phone, "555".into()),
            ],
        );

        let outcome = confirm_pending_exports(&cso, &[export]);
        assert!(outcome.confirmed.is_empty());
        let retry = &outcome.updated[0];
        assert_eq!(retry.status, PendingExportStatus::ExportNotConfirmed);
        assert_eq!(retry.error_count, 1);
        assert_eq!(
            retry.attribute_value_changes,
            vec![AttributeValueChange::update(f.phone, "555".into())]
        );
    }

    #[test]
    fn test_unconfirmed_export_is_retried_whole() {
        let f = Fixture::new();
        let cso = f.cso();
        let changes = vec![
            AttributeValueChange::update(f.mail, "b@example.com".into()),
            AttributeValueChange::update(f.phone, "555".into()),
        ];
        let export = f.exported(&cso, changes.clone());

        let outcome = confirm_pending_exports(&cso, &[export]);
        assert_eq!(outcome.updated[0].attribute_value_changes, changes);
        assert_eq!(outcome.updated[0].error_count, 1);
    }

    #[test]
    fn test_never_executed_export_untouched() {
        let f = Fixture::new();
        let cso = f.cso();
        let export = PendingExport::new(f.system, cso.id, PendingExportChangeType::Update);

        assert!(confirm_pending_exports(&cso, &[export]).is_empty());
    }

    #[test]
    fn test_delete_confirmed_by_obsolete_object() {
        let f = Fixture::new();
        let cso = f.cso().with_status(ConnectedSystemObjectStatus::Obsolete);
        let mut export = PendingExport::new(f.system, cso.id, PendingExportChangeType::Delete);
        export.status = PendingExportStatus::Exported;

        assert_eq!(confirm_pending_exports(&cso, &[export.clone()]).confirmed, vec![export.id]);
    }
}
