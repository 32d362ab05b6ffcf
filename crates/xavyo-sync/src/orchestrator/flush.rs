//! Flush of a page's deferred writes.
//!
//! Order matters: metaverse objects exist before change records and
//! exports reference them, provisioned objects exist before their exports,
//! and joins are broken before the metaverse objects they pointed at are
//! deleted.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, info, instrument};
use xavyo_metaverse::{
    ConnectedSystemObject, ConnectedSystemObjectId, ConnectedSystemObjectStatus,
    MetaverseAttributeId, MetaverseChangeKind, MetaverseObjectChange, MetaverseObjectId,
    ObjectChangeType, PendingExport,
};

use crate::batch::{PageBatch, QueuedDeletion};
use crate::drift::{evaluate_drift, has_enforcing_rules, DriftContext};
use crate::error::{SyncError, SyncResult};
use crate::export::{referenced_metaverse_objects, ExportContext, ExportEvaluation, ExportReferenceMap};

use super::context::RunContext;
use super::page::record_failure;
use super::SyncRunner;

/// What a flush wrote beyond the batch's own bookkeeping.
pub(super) struct FlushOutcome {
    pub pending_exports_created: usize,
    pub no_net_change_count: usize,
}

/// A metaverse object whose applied changes need export evaluation.
struct ChangedObject {
    id: MetaverseObjectId,
    changed: Vec<MetaverseAttributeId>,
    removed: Vec<MetaverseAttributeId>,
}

impl SyncRunner {
    #[instrument(skip_all, fields(page = batch.page_number()))]
    pub(super) async fn flush(&self, ctx: &RunContext, batch: &mut PageBatch) -> SyncResult<FlushOutcome> {
        let now = Utc::now();

        let created: Vec<MetaverseObjectId> = batch
            .metaverse_object_creates()
            .iter()
            .copied()
            .filter(|id| !batch.is_queued_for_deletion(*id))
            .collect();
        let updated: Vec<MetaverseObjectId> = batch
            .metaverse_object_updates()
            .iter()
            .copied()
            .filter(|id| !batch.is_queued_for_deletion(*id))
            .collect();

        let mut change_records = Vec::new();
        let mut changed_objects = Vec::new();
        let work = created
            .iter()
            .map(|id| (*id, MetaverseChangeKind::Created))
            .chain(updated.iter().map(|id| (*id, MetaverseChangeKind::Updated)));
        for (id, kind) in work {
            let initiator = batch.initiator_of(id);
            let Some(mvo) = batch.metaverse_object_mut(id) else {
                continue;
            };
            let applied = mvo.apply_pending_changes(now);
            if kind == MetaverseChangeKind::Created || !applied.is_empty() {
                change_records.push(
                    MetaverseObjectChange::from_applied(id, kind, &applied, now)
                        .initiated_by(initiator, ctx.activity_id),
                );
            }
            if !applied.is_empty() {
                changed_objects.push(ChangedObject {
                    id,
                    changed: applied.changed_attributes,
                    removed: applied.emptied_attributes,
                });
            }
        }

        if !ctx.dry_run {
            let creates: Vec<_> = created
                .iter()
                .filter_map(|id| batch.metaverse_object(*id).cloned())
                .collect();
            if !creates.is_empty() {
                self.repository.create_metaverse_objects(&creates).await?;
            }
            let updates: Vec<_> = updated
                .iter()
                .filter_map(|id| batch.metaverse_object(*id).cloned())
                .collect();
            if !updates.is_empty() {
                self.repository.update_metaverse_objects(&updates).await?;
            }
            if !change_records.is_empty() {
                self.repository
                    .create_metaverse_object_changes(&change_records)
                    .await?;
            }
        }

        let no_net_change_count = self.stage_exports(ctx, batch, &changed_objects).await?;

        if !ctx.dry_run {
            self.write_connected_system_side(batch).await?;
            self.write_metaverse_deletions(ctx, batch).await?;
            let created_items = batch.new_execution_items();
            if !created_items.is_empty() {
                self.repository.create_execution_items(&created_items).await?;
            }
            let adopted_items = batch.adopted_execution_items();
            if !adopted_items.is_empty() {
                self.repository.update_execution_items(&adopted_items).await?;
            }
        }

        debug!(
            created = created.len(),
            updated = updated.len(),
            deleted = batch.metaverse_object_deletes().len(),
            pending_exports = batch.pending_export_creates.len(),
            execution_items = batch.execution_items().len(),
            dry_run = ctx.dry_run,
            "Flushed page"
        );

        Ok(FlushOutcome {
            pending_exports_created: batch.pending_export_creates.len(),
            no_net_change_count,
        })
    }

    /// Evaluate exports for changed and deleted metaverse objects, and drift
    /// for reconciled objects. Returns the no-net-change count.
    async fn stage_exports(
        &self,
        ctx: &RunContext,
        batch: &mut PageBatch,
        changed_objects: &[ChangedObject],
    ) -> SyncResult<usize> {
        let deletions: Vec<QueuedDeletion> = batch.metaverse_object_deletes().to_vec();
        let drift_targets: Vec<(ConnectedSystemObjectId, MetaverseObjectId)> =
            if has_enforcing_rules(ctx.system.id, &ctx.export_rules) {
                batch
                    .reconciled()
                    .iter()
                    .filter_map(|id| {
                        let mvo_id = batch.connected_system_object(*id)?.metaverse_object_id?;
                        (!batch.is_queued_for_deletion(mvo_id)).then_some((*id, mvo_id))
                    })
                    .collect()
            } else {
                Vec::new()
            };
        if changed_objects.is_empty() && deletions.is_empty() && drift_targets.is_empty() {
            return Ok(0);
        }

        let mut involved: HashSet<MetaverseObjectId> = changed_objects.iter().map(|c| c.id).collect();
        involved.extend(deletions.iter().map(|d| d.metaverse_object_id));
        involved.extend(drift_targets.iter().map(|(_, mvo_id)| *mvo_id));
        let mut lookup = involved.clone();
        for id in &involved {
            if let Some(mvo) = batch.metaverse_object(*id) {
                lookup.extend(referenced_metaverse_objects(mvo));
            }
        }

        let lookup_ids: Vec<MetaverseObjectId> = lookup.iter().copied().collect();
        let stored = self
            .repository
            .get_joined_connected_system_objects(&lookup_ids)
            .await?;
        let mut references = ExportReferenceMap::new();
        let mut joined: HashMap<MetaverseObjectId, Vec<ConnectedSystemObject>> = HashMap::new();
        for cso in batch.joined_objects(stored, &lookup) {
            if let Some(mvo_id) = cso.metaverse_object_id {
                references.insert(mvo_id, cso.connected_system_id, cso.id);
                joined.entry(mvo_id).or_default().push(cso);
            }
        }

        let pending = self.pending_export_view(batch, &joined).await?;

        let export_ctx = ExportContext {
            connected_systems: &ctx.connected_systems,
            object_types: &ctx.object_types,
            export_rules: &ctx.export_rules,
            joined: &joined,
            pending_exports: &pending,
            references: &references,
            expressions: self.expressions.as_ref(),
            source_system: Some(ctx.system.id),
        };

        let mut evaluation = ExportEvaluation::default();
        let mut deletes: Vec<PendingExport> = Vec::new();
        for changed in changed_objects {
            let Some(mvo) = batch.metaverse_object(changed.id) else {
                continue;
            };
            evaluation.merge(
                self.export_evaluator
                    .evaluate_export_rules(mvo, &changed.changed, &changed.removed, &export_ctx)
                    .await?,
            );
            deletes.extend(
                self.export_evaluator
                    .evaluate_out_of_scope_exports(mvo, &export_ctx)
                    .await?,
            );
        }

        let mut unprovisioned: Vec<ConnectedSystemObjectId> = Vec::new();
        for deletion in &deletions {
            let Some(mvo) = batch.metaverse_object(deletion.metaverse_object_id) else {
                continue;
            };
            let targets = joined.get(&mvo.id).map(Vec::as_slice).unwrap_or(&[]);
            deletes.extend(
                self.export_evaluator
                    .evaluate_deletion_exports(mvo, &export_ctx)
                    .await?,
            );
            unprovisioned.extend(
                targets
                    .iter()
                    .filter(|c| c.status == ConnectedSystemObjectStatus::PendingProvisioning)
                    .map(|c| c.id),
            );
        }

        let mut corrections = Vec::new();
        let mut failures: Vec<(ConnectedSystemObjectId, SyncError)> = Vec::new();
        for (cso_id, mvo_id) in drift_targets {
            let (Some(cso), Some(mvo)) = (
                batch.connected_system_object(cso_id),
                batch.metaverse_object(mvo_id),
            ) else {
                continue;
            };
            let drift_ctx = DriftContext {
                system: &ctx.system,
                mv_type: ctx.mv_type(mvo.type_id)?,
                export_rules: &ctx.export_rules,
                contributors: &ctx.contributors,
                references: &references,
                expressions: self.expressions.as_ref(),
            };
            match evaluate_drift(cso, mvo, &drift_ctx) {
                Ok(result) => {
                    if let Some(export) = result.corrective_export {
                        info!(
                            cso_id = %cso_id,
                            attributes = result.drifted_attributes.len(),
                            "Staging drift correction"
                        );
                        corrections.push((cso_id, mvo_id, export));
                    }
                }
                Err(e) => failures.push((cso_id, e)),
            }
        }

        let no_net_change_count = evaluation.no_net_change_count;
        batch.provisioning_csos.extend(evaluation.provisioning_csos);
        for export in evaluation.updated_exports {
            batch.stage_pending_export_update(export);
        }
        for export in evaluation.pending_exports.into_iter().chain(deletes) {
            batch.stage_pending_export(export);
        }
        for cso_id in unprovisioned {
            batch.queue_connected_system_object_delete(cso_id);
        }

        for (cso_id, mvo_id, export) in corrections {
            match pending.get(&cso_id) {
                Some(stored) => {
                    let mut merged = stored.clone();
                    merged.merge_changes(export.attribute_value_changes);
                    batch.stage_pending_export_update(merged);
                }
                None => batch.stage_pending_export(export),
            }
            batch.record(
                ctx.item(cso_id, ObjectChangeType::DriftCorrection)
                    .with_metaverse_object(mvo_id),
            );
        }
        for (cso_id, error) in failures {
            record_failure(ctx, batch, cso_id, error)?;
        }

        Ok(no_net_change_count)
    }

    /// Not-yet-executed exports per target object, as this page sees them.
    async fn pending_export_view(
        &self,
        batch: &PageBatch,
        joined: &HashMap<MetaverseObjectId, Vec<ConnectedSystemObject>>,
    ) -> SyncResult<HashMap<ConnectedSystemObjectId, PendingExport>> {
        let mut pending: HashMap<ConnectedSystemObjectId, PendingExport> = batch
            .pending_exports
            .values()
            .flatten()
            .filter(|e| e.is_pending())
            .map(|e| (e.connected_system_object_id, e.clone()))
            .collect();

        let outside: Vec<ConnectedSystemObjectId> = joined
            .values()
            .flatten()
            .filter(|c| batch.connected_system_object(c.id).is_none())
            .map(|c| c.id)
            .collect();
        if !outside.is_empty() {
            for export in self.repository.get_pending_exports(&outside).await? {
                if export.is_pending() {
                    pending
                        .entry(export.connected_system_object_id)
                        .or_insert(export);
                }
            }
        }

        for export in batch.pending_export_updates.iter().filter(|e| e.is_pending()) {
            pending.insert(export.connected_system_object_id, export.clone());
        }
        Ok(pending)
    }

    async fn write_connected_system_side(&self, batch: &PageBatch) -> SyncResult<()> {
        if !batch.provisioning_csos.is_empty() {
            self.repository
                .create_connected_system_objects(&batch.provisioning_csos)
                .await?;
        }
        if !batch.pending_export_creates.is_empty() {
            self.repository
                .create_pending_exports(&batch.pending_export_creates)
                .await?;
        }
        if !batch.pending_export_updates.is_empty() {
            self.repository
                .update_pending_exports(&batch.pending_export_updates)
                .await?;
        }
        if !batch.pending_export_deletes.is_empty() {
            self.repository
                .delete_pending_exports(&batch.pending_export_deletes)
                .await?;
        }

        let updates = batch.connected_system_object_updates();
        if !updates.is_empty() {
            self.repository
                .update_connected_system_objects(&updates)
                .await?;
        }
        if !batch.connected_system_object_deletes().is_empty() {
            self.repository
                .delete_connected_system_objects(batch.connected_system_object_deletes())
                .await?;
        }
        Ok(())
    }

    async fn write_metaverse_deletions(&self, ctx: &RunContext, batch: &PageBatch) -> SyncResult<()> {
        let deletions = batch.metaverse_object_deletes();
        if deletions.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let records: Vec<MetaverseObjectChange> = deletions
            .iter()
            .map(|d| {
                MetaverseObjectChange::deleted(d.metaverse_object_id, now).initiated_by(
                    Some(d.initiator.connected_system_object_id),
                    ctx.activity_id,
                )
            })
            .collect();
        self.repository
            .create_metaverse_object_changes(&records)
            .await?;

        let ids: Vec<MetaverseObjectId> = deletions.iter().map(|d| d.metaverse_object_id).collect();
        self.repository.delete_metaverse_objects(&ids).await?;
        info!(count = ids.len(), "Deleted metaverse objects");
        Ok(())
    }
}
