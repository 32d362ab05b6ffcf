//! Per-page processing.
//!
//! Pass 1 confirms executed exports and tears down obsolete objects for the
//! whole page, so every disconnect is visible before pass 2 attempts joins.
//! Pass 2 scopes, joins or projects, and flows non-reference attributes.
//! Reference attributes flow once the whole page has metaverse objects.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use xavyo_metaverse::{
    ConnectedSystemId, ConnectedSystemObject, ConnectedSystemObjectId, ConnectedSystemObjectStatus,
    ExecutionErrorType, ExecutionItem, InboundOutOfScopeAction, MetaverseObject,
    MetaverseObjectId, ObjectChangeType, SyncRule, SyncRuleId,
};

use crate::batch::{CrossPageReference, PageBatch};
use crate::deletion::{on_disconnect, DeletionDecision};
use crate::error::{SyncError, SyncResult};
use crate::export::confirm_pending_exports;
use crate::expression::ExpressionEvaluator;
use crate::flow::{
    flow_import_rule, referenced_objects, FlowContext, FlowOutcome, FlowPass, ReferenceResolver,
};
use crate::join::{join, project, try_join, JoinOutcome};
use crate::scope::{evaluate_scope, ScopeDecision};

use super::context::RunContext;
use super::SyncRunner;

/// What one page produced.
pub(super) struct PageOutcome {
    /// Objects that completed both passes.
    pub processed: usize,
    pub cancelled: bool,
    pub cross_page: Vec<CrossPageReference>,
    pub execution_items: Vec<ExecutionItem>,
    pub pending_exports_created: usize,
    pub no_net_change_count: usize,
}

impl SyncRunner {
    #[instrument(skip(self, ctx, objects), fields(page = page_number, objects = objects.len()))]
    pub(super) async fn process_page(
        &self,
        ctx: &RunContext,
        page_number: usize,
        objects: Vec<ConnectedSystemObject>,
    ) -> SyncResult<PageOutcome> {
        let mut batch = self.load_batch(page_number, objects).await?;
        let order = batch.object_ids();
        let mut cancelled = false;
        let mut failed: HashSet<ConnectedSystemObjectId> = HashSet::new();

        let mut torn_down = Vec::with_capacity(order.len());
        for &cso_id in &order {
            if self.cancellation.is_cancelled() {
                cancelled = true;
                break;
            }
            if let Err(e) = self.teardown(ctx, &mut batch, cso_id).await {
                record_failure(ctx, &mut batch, cso_id, e)?;
                failed.insert(cso_id);
            }
            torn_down.push(cso_id);
        }

        let mut completed = Vec::with_capacity(torn_down.len());
        for &cso_id in &torn_down {
            if self.cancellation.is_cancelled() {
                cancelled = true;
                break;
            }
            if failed.contains(&cso_id) {
                continue;
            }
            match self.reconcile(ctx, &mut batch, cso_id).await {
                Ok(()) => completed.push(cso_id),
                Err(e) => record_failure(ctx, &mut batch, cso_id, e)?,
            }
        }

        self.flow_deferred_references(ctx, &mut batch).await?;

        for &cso_id in &completed {
            if batch.is_queued_for_removal(cso_id) {
                continue;
            }
            let committed = batch
                .connected_system_object_mut(cso_id)
                .is_some_and(|cso| cso.commit_pending_changes());
            if committed {
                batch.mark_connected_system_object_updated(cso_id);
            }
        }

        let flushed = self.flush(ctx, &mut batch).await?;
        let cross_page = batch.take_cross_page_references();

        debug!(
            processed = completed.len(),
            failed = failed.len(),
            cross_page = cross_page.len(),
            "Page processed"
        );

        Ok(PageOutcome {
            processed: completed.len(),
            cancelled,
            cross_page,
            execution_items: batch.new_execution_items(),
            pending_exports_created: flushed.pending_exports_created,
            no_net_change_count: flushed.no_net_change_count,
        })
    }

    /// Load objects into a fresh batch with their joined metaverse objects
    /// and stored pending exports.
    pub(super) async fn load_batch(
        &self,
        page_number: usize,
        objects: Vec<ConnectedSystemObject>,
    ) -> SyncResult<PageBatch> {
        let mut batch = PageBatch::new(page_number);
        let cso_ids: Vec<ConnectedSystemObjectId> = objects.iter().map(|c| c.id).collect();
        let mvo_ids: Vec<MetaverseObjectId> = objects
            .iter()
            .filter_map(|c| c.metaverse_object_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        batch.load_objects(objects);

        if !mvo_ids.is_empty() {
            for mvo in self.repository.get_metaverse_objects(&mvo_ids).await? {
                batch.insert_metaverse_object(mvo);
            }
        }
        if !cso_ids.is_empty() {
            for export in self.repository.get_pending_exports(&cso_ids).await? {
                batch
                    .pending_exports
                    .entry(export.connected_system_object_id)
                    .or_default()
                    .push(export);
            }
        }
        Ok(batch)
    }

    /// Pass 1 for one object: confirm executed exports, then tear down the
    /// object if the import marked it obsolete.
    async fn teardown(
        &self,
        ctx: &RunContext,
        batch: &mut PageBatch,
        cso_id: ConnectedSystemObjectId,
    ) -> SyncResult<()> {
        let Some(cso) = batch.connected_system_object(cso_id) else {
            return Ok(());
        };
        if cso.status == ConnectedSystemObjectStatus::PendingProvisioning {
            return Ok(());
        }

        if let Some(exports) = batch.pending_exports.get(&cso_id) {
            let outcome = confirm_pending_exports(cso, exports);
            if !outcome.is_empty() {
                let confirmed = outcome.confirmed_count();
                if let Some(stored) = batch.pending_exports.get_mut(&cso_id) {
                    stored.retain(|e| !outcome.confirmed.contains(&e.id));
                    for updated in &outcome.updated {
                        if let Some(slot) = stored.iter_mut().find(|e| e.id == updated.id) {
                            *slot = updated.clone();
                        }
                    }
                }
                for id in outcome.confirmed {
                    batch.stage_pending_export_delete(id);
                }
                for export in outcome.updated {
                    batch.stage_pending_export_update(export);
                }
                if confirmed > 0 {
                    batch.record(ctx.item(cso_id, ObjectChangeType::PendingExportConfirmed));
                }
            }
        }

        let Some(cso) = batch.connected_system_object(cso_id) else {
            return Ok(());
        };
        if !cso.is_obsolete() {
            return Ok(());
        }

        let remove_contributed = ctx
            .cs_type(cso.type_id)?
            .remove_contributed_attributes_on_obsoletion;
        if cso.is_joined() {
            self.disconnect(ctx, batch, cso_id, remove_contributed, ObjectChangeType::Disconnected)
                .await?;
        }
        batch.queue_connected_system_object_delete(cso_id);
        batch.record(ctx.item(cso_id, ObjectChangeType::Deleted));
        debug!(cso_id = %cso_id, "Obsolete connected system object queued for deletion");
        Ok(())
    }

    /// Break an object's join and apply the metaverse object's deletion rule.
    async fn disconnect(
        &self,
        ctx: &RunContext,
        batch: &mut PageBatch,
        cso_id: ConnectedSystemObjectId,
        remove_contributed: bool,
        change: ObjectChangeType,
    ) -> SyncResult<()> {
        let Some(cso) = batch.connected_system_object_mut(cso_id) else {
            return Ok(());
        };
        let Some(mvo_id) = cso.disconnect() else {
            return Ok(());
        };
        let system_id = cso.connected_system_id;
        let initiator = ctx.initiator(cso);
        batch.mark_connected_system_object_updated(cso_id);
        batch.record(ctx.item(cso_id, change).with_metaverse_object(mvo_id));

        if !self.ensure_metaverse_object(batch, mvo_id).await? {
            warn!(cso_id = %cso_id, mvo_id = %mvo_id, "Disconnected from a missing metaverse object");
            return Ok(());
        }
        let stored = self
            .repository
            .get_joined_connected_system_objects(&[mvo_id])
            .await?;
        let remaining = batch.effective_join_count(mvo_id, None, stored, cso_id);

        let (decision, stripped) = {
            let Some(mvo) = batch.metaverse_object_mut(mvo_id) else {
                return Ok(());
            };
            let stripped = if remove_contributed {
                strip_contributed_values(mvo, system_id)
            } else {
                0
            };
            let mv_type = ctx.mv_type(mvo.type_id)?;
            let decision = on_disconnect(mvo, mv_type, &initiator, remaining, Utc::now());
            if let DeletionDecision::MarkForDeletion { date, initiator } = &decision {
                mvo.mark_for_deletion(*date, initiator.clone());
            }
            (decision, stripped)
        };

        if stripped > 0 {
            batch.mark_metaverse_object_updated(mvo_id, Some(cso_id));
        }
        match decision {
            DeletionDecision::NotEligible => {}
            DeletionDecision::MarkForDeletion { date, .. } => {
                batch.mark_metaverse_object_updated(mvo_id, Some(cso_id));
                info!(
                    mvo_id = %mvo_id,
                    disconnected_at = %date,
                    "Metaverse object marked for deletion"
                );
            }
            DeletionDecision::DeleteNow { initiator } => {
                batch.queue_metaverse_object_delete(mvo_id, initiator);
                info!(mvo_id = %mvo_id, "Metaverse object queued for deletion");
            }
        }
        debug!(
            cso_id = %cso_id,
            mvo_id = %mvo_id,
            remaining_joins = remaining,
            stripped_values = stripped,
            change = %change,
            "Disconnected connected system object"
        );
        Ok(())
    }

    /// Make sure a metaverse object is in the batch. Returns false when it
    /// does not exist.
    async fn ensure_metaverse_object(
        &self,
        batch: &mut PageBatch,
        mvo_id: MetaverseObjectId,
    ) -> SyncResult<bool> {
        if batch.contains_metaverse_object(mvo_id) {
            return Ok(true);
        }
        match self
            .repository
            .get_metaverse_objects(&[mvo_id])
            .await?
            .into_iter()
            .next()
        {
            Some(mvo) => {
                batch.insert_metaverse_object(mvo);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pass 2 for one object.
    async fn reconcile(
        &self,
        ctx: &RunContext,
        batch: &mut PageBatch,
        cso_id: ConnectedSystemObjectId,
    ) -> SyncResult<()> {
        let Some(cso) = batch.connected_system_object(cso_id).cloned() else {
            return Ok(());
        };
        if cso.status != ConnectedSystemObjectStatus::Normal || batch.is_queued_for_removal(cso_id) {
            return Ok(());
        }

        let rules = match evaluate_scope(&cso, &ctx.import_rules) {
            ScopeDecision::NoApplicableRules => return Ok(()),
            ScopeDecision::OutOfScope(action) => {
                if cso.is_joined() {
                    match action {
                        InboundOutOfScopeAction::RemainJoined => {
                            debug!(cso_id = %cso_id, "Out of scope, remaining joined");
                        }
                        InboundOutOfScopeAction::Disconnect => {
                            let remove_contributed = ctx
                                .cs_type(cso.type_id)?
                                .remove_contributed_attributes_on_obsoletion;
                            self.disconnect(
                                ctx,
                                batch,
                                cso_id,
                                remove_contributed,
                                ObjectChangeType::DisconnectedOutOfScope,
                            )
                            .await?;
                        }
                    }
                }
                return Ok(());
            }
            ScopeDecision::InScope(rules) => rules,
        };

        let mvo_id = match cso.metaverse_object_id {
            Some(mvo_id) => {
                if !self.ensure_metaverse_object(batch, mvo_id).await? {
                    return Err(SyncError::not_found("metaverse object", mvo_id));
                }
                mvo_id
            }
            None => match self.join_or_project(ctx, batch, &cso, &rules).await? {
                Some(mvo_id) => mvo_id,
                None => return Ok(()),
            },
        };

        self.flow_non_reference(ctx, batch, cso_id, mvo_id, &rules)
    }

    async fn join_or_project(
        &self,
        ctx: &RunContext,
        batch: &mut PageBatch,
        cso: &ConnectedSystemObject,
        rules: &[&SyncRule],
    ) -> SyncResult<Option<MetaverseObjectId>> {
        let outcome = try_join(
            cso,
            rules,
            self.matcher.as_ref(),
            self.repository.as_ref(),
            batch,
        )
        .await?;

        match outcome {
            JoinOutcome::Joined(mvo_id) => {
                if !self.ensure_metaverse_object(batch, mvo_id).await? {
                    return Err(SyncError::not_found("metaverse object", mvo_id));
                }
                let (Some(target), Some(mvo)) = (
                    batch.connected_system_objects.get_mut(&cso.id),
                    batch.metaverse_objects.get_mut(&mvo_id),
                ) else {
                    return Ok(None);
                };
                let reconnected = join(target, mvo, Utc::now());

                batch.cancel_metaverse_object_delete(mvo_id);
                batch.mark_connected_system_object_updated(cso.id);
                if reconnected {
                    batch.mark_metaverse_object_updated(mvo_id, Some(cso.id));
                }
                batch.record(ctx.item(cso.id, ObjectChangeType::Joined).with_metaverse_object(mvo_id));
                debug!(cso_id = %cso.id, mvo_id = %mvo_id, reconnected, "Joined metaverse object");
                Ok(Some(mvo_id))
            }
            JoinOutcome::AmbiguousMatch(candidates) => {
                warn!(cso_id = %cso.id, candidates = candidates.len(), "Ambiguous match");
                batch.record(ctx.error_item(
                    cso.id,
                    ExecutionErrorType::AmbiguousMatch,
                    format!("{} metaverse objects matched", candidates.len()),
                ));
                Ok(None)
            }
            JoinOutcome::AlreadyJoined(mvo_id) => {
                warn!(cso_id = %cso.id, mvo_id = %mvo_id, "Matched object already joined");
                batch.record(ctx.error_item(
                    cso.id,
                    ExecutionErrorType::CouldNotJoinDueToExistingJoin,
                    format!(
                        "Metaverse object {mvo_id} is already joined to an object of this connected system"
                    ),
                ));
                Ok(None)
            }
            JoinOutcome::NoMatch => {
                let Some(rule) = rules.iter().find(|r| r.project_to_metaverse) else {
                    debug!(cso_id = %cso.id, "No match and no projecting rule");
                    return Ok(None);
                };
                let Some(target) = batch.connected_system_object_mut(cso.id) else {
                    return Ok(None);
                };
                let mvo = project(target, rule, Utc::now());
                let mvo_id = mvo.id;
                batch.queue_metaverse_object_create(mvo, cso.id);
                batch.mark_connected_system_object_updated(cso.id);
                batch.record(ctx.item(cso.id, ObjectChangeType::Projected).with_metaverse_object(mvo_id));
                debug!(cso_id = %cso.id, mvo_id = %mvo_id, rule = %rule.name, "Projected metaverse object");
                Ok(Some(mvo_id))
            }
        }
    }

    fn flow_non_reference(
        &self,
        ctx: &RunContext,
        batch: &mut PageBatch,
        cso_id: ConnectedSystemObjectId,
        mvo_id: MetaverseObjectId,
        rules: &[&SyncRule],
    ) -> SyncResult<()> {
        let resolver = ReferenceResolver::new();
        let (outcome, rule_ids) = {
            let (Some(cso), Some(mvo)) = (
                batch.connected_system_objects.get(&cso_id),
                batch.metaverse_objects.get_mut(&mvo_id),
            ) else {
                return Ok(());
            };
            let mv_type_id = mvo.type_id;
            let flow_ctx = FlowContext {
                cs_type: ctx.cs_type(cso.type_id)?,
                mv_type: ctx.mv_type(mv_type_id)?,
                references: &resolver,
                expressions: self.expressions.as_ref(),
            };

            let mut outcome = FlowOutcome::default();
            let mut rule_ids: Vec<SyncRuleId> = Vec::new();
            for rule in rules.iter().filter(|r| r.metaverse_object_type_id == mv_type_id) {
                outcome.merge(flow_import_rule(rule, cso, mvo, FlowPass::NonReference, &flow_ctx)?);
                rule_ids.push(rule.id);
            }
            (outcome, rule_ids)
        };

        if outcome.has_changes() {
            batch.mark_metaverse_object_updated(mvo_id, Some(cso_id));
            add_flow_count(ctx, batch, cso_id, mvo_id, outcome.value_count());
        }
        batch.defer_reference_flow(cso_id, rule_ids);
        batch.mark_reconciled(cso_id);
        Ok(())
    }

    /// Reference flow for every object of the page that reached pass 2.
    async fn flow_deferred_references(&self, ctx: &RunContext, batch: &mut PageBatch) -> SyncResult<()> {
        let deferred = batch.take_deferred_references();
        if deferred.is_empty() {
            return Ok(());
        }
        let ids: Vec<ConnectedSystemObjectId> = deferred.iter().map(|(id, _)| *id).collect();
        let resolver = self.build_resolver(batch, &ids).await?;

        for (cso_id, rule_ids) in deferred {
            match flow_references(ctx, self.expressions.as_ref(), batch, cso_id, &rule_ids, &resolver) {
                Ok(outcome) => {
                    apply_reference_outcome(ctx, batch, cso_id, &outcome);
                    if outcome.has_unresolved_references() {
                        debug!(
                            cso_id = %cso_id,
                            unresolved = outcome.unresolved.len(),
                            "Deferring references to cross-page resolution"
                        );
                        let execution_item = batch.item_for(cso_id).cloned();
                        batch.record_cross_page_reference(CrossPageReference {
                            connected_system_object_id: cso_id,
                            sync_rule_ids: rule_ids,
                            execution_item,
                        });
                    }
                }
                Err(e) => record_failure(ctx, batch, cso_id, e)?,
            }
        }
        Ok(())
    }

    /// Join lookups for reference values: the batch's own objects first,
    /// then stored objects referenced from outside the batch.
    pub(super) async fn build_resolver(
        &self,
        batch: &PageBatch,
        cso_ids: &[ConnectedSystemObjectId],
    ) -> SyncResult<ReferenceResolver> {
        let mut resolver = ReferenceResolver::new();
        for cso in batch.connected_system_objects.values() {
            if let Some(mvo_id) = cso.metaverse_object_id {
                resolver.insert(cso.id, mvo_id);
            }
        }

        let mut outside: Vec<ConnectedSystemObjectId> = Vec::new();
        for cso in cso_ids.iter().filter_map(|id| batch.connected_system_object(*id)) {
            for referenced in referenced_objects(cso) {
                if batch.connected_system_object(referenced).is_none() && !outside.contains(&referenced) {
                    outside.push(referenced);
                }
            }
        }
        if !outside.is_empty() {
            for cso in self.repository.get_connected_system_objects(&outside).await? {
                if let Some(mvo_id) = cso.metaverse_object_id {
                    resolver.insert(cso.id, mvo_id);
                }
            }
        }
        Ok(resolver)
    }
}

/// Run the reference-only pass of the given rules for one object.
pub(super) fn flow_references(
    ctx: &RunContext,
    expressions: &dyn ExpressionEvaluator,
    batch: &mut PageBatch,
    cso_id: ConnectedSystemObjectId,
    rule_ids: &[SyncRuleId],
    resolver: &ReferenceResolver,
) -> SyncResult<FlowOutcome> {
    let Some(cso) = batch.connected_system_objects.get(&cso_id) else {
        return Ok(FlowOutcome::default());
    };
    let Some(mvo_id) = cso.metaverse_object_id else {
        return Ok(FlowOutcome::default());
    };
    let Some(mvo) = batch.metaverse_objects.get_mut(&mvo_id) else {
        return Ok(FlowOutcome::default());
    };

    let flow_ctx = FlowContext {
        cs_type: ctx.cs_type(cso.type_id)?,
        mv_type: ctx.mv_type(mvo.type_id)?,
        references: resolver,
        expressions,
    };
    let mut outcome = FlowOutcome::default();
    for rule in ctx.import_rules.iter().filter(|r| rule_ids.contains(&r.id)) {
        outcome.merge(flow_import_rule(rule, cso, mvo, FlowPass::ReferenceOnly, &flow_ctx)?);
    }
    Ok(outcome)
}

/// Record what a reference flow staged on the object's execution items.
pub(super) fn apply_reference_outcome(
    ctx: &RunContext,
    batch: &mut PageBatch,
    cso_id: ConnectedSystemObjectId,
    outcome: &FlowOutcome,
) {
    let mvo_id = batch
        .connected_system_object(cso_id)
        .and_then(|c| c.metaverse_object_id);
    if let (Some(mvo_id), true) = (mvo_id, outcome.has_changes()) {
        batch.mark_metaverse_object_updated(mvo_id, Some(cso_id));
        add_flow_count(ctx, batch, cso_id, mvo_id, outcome.value_count());
    }
    if !outcome.dangling.is_empty() {
        warn!(cso_id = %cso_id, values = ?outcome.dangling, "Reference values cannot be resolved");
        batch.record(ctx.error_item(
            cso_id,
            ExecutionErrorType::UnresolvedReference,
            format!("Unresolvable reference values: {}", outcome.dangling.join(", ")),
        ));
    }
}

/// Add flowed value counts to the object's join, projection or flow item,
/// recording a flow item if it has none.
fn add_flow_count(
    ctx: &RunContext,
    batch: &mut PageBatch,
    cso_id: ConnectedSystemObjectId,
    mvo_id: MetaverseObjectId,
    count: usize,
) {
    if let Some(item) = batch.item_for_mut(cso_id) {
        item.attribute_flow_count += count;
        if item.metaverse_object_id.is_none() {
            item.metaverse_object_id = Some(mvo_id);
        }
        return;
    }
    batch.record(
        ctx.item(cso_id, ObjectChangeType::AttributeFlow)
            .with_metaverse_object(mvo_id)
            .with_attribute_flow_count(count),
    );
}

/// Stage removal of every value a system contributed, withdrawing its
/// staged additions too. Returns the number of values affected.
fn strip_contributed_values(
    mvo: &mut MetaverseObject,
    system_id: ConnectedSystemId,
) -> usize {
    let before = mvo.pending_attribute_value_additions.len();
    mvo.pending_attribute_value_additions
        .retain(|e| e.contributed_by != Some(system_id));
    let withdrawn = before - mvo.pending_attribute_value_additions.len();

    let contributed: Vec<_> = mvo
        .attribute_values
        .iter()
        .filter(|e| e.contributed_by == Some(system_id))
        .cloned()
        .collect();
    let removed = contributed.len();
    for entry in contributed {
        mvo.stage_removal(entry);
    }
    withdrawn + removed
}

/// Turn a per-object error into an execution item, or abort the run if the
/// error is systemic.
pub(super) fn record_failure(
    ctx: &RunContext,
    batch: &mut PageBatch,
    cso_id: ConnectedSystemObjectId,
    error: SyncError,
) -> SyncResult<()> {
    if error.is_systemic() {
        return Err(error);
    }
    error!(cso_id = %cso_id, error = %error, "Failed to process connected system object");
    batch.record(ctx.error_item(
        cso_id,
        ExecutionErrorType::UnhandledError,
        error.to_string(),
    ));
    Ok(())
}
