//! Export rule evaluation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use xavyo_metaverse::{
    AttributeValueChange, ConnectedSystem, ConnectedSystemId, ConnectedSystemObject,
    ConnectedSystemObjectId, ConnectedSystemObjectStatus, JoinType, MetaverseAttributeId,
    MetaverseObject, MetaverseObjectId, MetaverseObjectType, MetaverseObjectTypeId, PendingExport,
    PendingExportChangeType, SyncRule,
};

use super::{attribute_changes, export_flow_values, ExportFlowInput, ExportReferenceMap};
use crate::error::{SyncError, SyncResult};
use crate::expression::ExpressionEvaluator;
use crate::scope::groups_match;

/// Everything export evaluation reads, assembled by the caller so the
/// evaluator itself needs no storage access.
pub struct ExportContext<'a> {
    pub connected_systems: &'a HashMap<ConnectedSystemId, ConnectedSystem>,
    pub object_types: &'a HashMap<MetaverseObjectTypeId, MetaverseObjectType>,
    /// Enabled export rules of every connected system.
    pub export_rules: &'a [SyncRule],
    /// Objects joined to each metaverse object, including unflushed joins.
    pub joined: &'a HashMap<MetaverseObjectId, Vec<ConnectedSystemObject>>,
    /// Exports not yet executed, by target object.
    pub pending_exports: &'a HashMap<ConnectedSystemObjectId, PendingExport>,
    pub references: &'a ExportReferenceMap,
    pub expressions: &'a dyn ExpressionEvaluator,
    /// System whose import caused the change; its own rules are not evaluated.
    pub source_system: Option<ConnectedSystemId>,
}

impl ExportContext<'_> {
    fn joined_in(
        &self,
        mvo_id: MetaverseObjectId,
        system_id: ConnectedSystemId,
    ) -> Option<&ConnectedSystemObject> {
        self.joined
            .get(&mvo_id)?
            .iter()
            .find(|c| c.connected_system_id == system_id)
    }

    /// Whether the system has an enabled export rule for the metaverse type.
    fn exports_type_to(&self, system_id: ConnectedSystemId, type_id: MetaverseObjectTypeId) -> bool {
        self.export_rules.iter().any(|r| {
            r.enabled
                && r.is_export()
                && r.connected_system_id == system_id
                && r.metaverse_object_type_id == type_id
        })
    }

    fn rules_for<'r>(&'r self, mvo: &'r MetaverseObject) -> impl Iterator<Item = &'r SyncRule> + 'r {
        self.export_rules.iter().filter(move |r| {
            r.enabled
                && r.is_export()
                && r.metaverse_object_type_id == mvo.type_id
                && Some(r.connected_system_id) != self.source_system
        })
    }
}

/// Result of evaluating export rules for one metaverse object.
#[derive(Debug, Clone, Default)]
pub struct ExportEvaluation {
    /// Newly staged exports.
    pub pending_exports: Vec<PendingExport>,
    /// Existing not-yet-executed exports that absorbed new changes.
    pub updated_exports: Vec<PendingExport>,
    /// Objects to create in target systems, each with a `Create` export.
    pub provisioning_csos: Vec<ConnectedSystemObject>,
    /// Targets whose values already matched.
    pub no_net_change_count: usize,
}

impl ExportEvaluation {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending_exports.is_empty()
            && self.updated_exports.is_empty()
            && self.provisioning_csos.is_empty()
    }

    pub fn merge(&mut self, other: ExportEvaluation) {
        self.pending_exports.extend(other.pending_exports);
        self.updated_exports.extend(other.updated_exports);
        self.provisioning_csos.extend(other.provisioning_csos);
        self.no_net_change_count += other.no_net_change_count;
    }
}

/// Decides which connected systems need a pending export after a
/// metaverse object changed.
#[async_trait]
pub trait ExportEvaluator: Send + Sync {
    /// Stage exports for attributes that changed or were emptied.
    async fn evaluate_export_rules(
        &self,
        mvo: &MetaverseObject,
        changed: &[MetaverseAttributeId],
        removed: &[MetaverseAttributeId],
        ctx: &ExportContext<'_>,
    ) -> SyncResult<ExportEvaluation>;

    /// Stage deletes for targets of export rules the object fell out of scope of.
    async fn evaluate_out_of_scope_exports(
        &self,
        mvo: &MetaverseObject,
        ctx: &ExportContext<'_>,
    ) -> SyncResult<Vec<PendingExport>>;

    /// Stage deletes for the joined objects of a metaverse object being
    /// deleted, in systems that export its type.
    async fn evaluate_deletion_exports(
        &self,
        mvo: &MetaverseObject,
        ctx: &ExportContext<'_>,
    ) -> SyncResult<Vec<PendingExport>>;
}

/// Export evaluator driven by export sync rules.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedExportEvaluator;

impl RuleBasedExportEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn provision(
        rule: &SyncRule,
        system: &ConnectedSystem,
        mvo: &MetaverseObject,
        mv_type: &MetaverseObjectType,
        ctx: &ExportContext<'_>,
    ) -> SyncResult<Option<(ConnectedSystemObject, PendingExport)>> {
        let cs_type = system
            .object_type(rule.connected_system_object_type_id)
            .ok_or_else(|| {
                SyncError::missing_schema("connected system object type", rule.connected_system_object_type_id)
            })?;

        let Some(external_id) = cs_type.external_id_attribute_id.or_else(|| {
            rule.attribute_flow_rules
                .first()
                .map(|f| f.connected_system_attribute_id)
        }) else {
            warn!(rule = %rule.name, "Cannot provision without an external id attribute");
            return Ok(None);
        };

        let input = ExportFlowInput {
            mvo,
            mv_type,
            target_system: system.id,
            references: ctx.references,
            expressions: ctx.expressions,
            exclude_contributed_by: None,
        };

        let mut changes = Vec::new();
        for flow in &rule.attribute_flow_rules {
            let Some(target) = cs_type.attribute(flow.connected_system_attribute_id) else {
                continue;
            };
            if let Some(values) = export_flow_values(flow, target, &input)? {
                changes.extend(
                    values
                        .into_iter()
                        .map(|v| AttributeValueChange::add(target.id, v)),
                );
            }
        }

        let mut cso = ConnectedSystemObject::new(system.id, cs_type.id, external_id)
            .with_status(ConnectedSystemObjectStatus::PendingProvisioning);
        cso.join_to(mvo.id, JoinType::Provisioned, Utc::now());

        let export = PendingExport::new(system.id, cso.id, PendingExportChangeType::Create)
            .with_changes(changes)
            .with_source(mvo.id);

        info!(
            rule = %rule.name,
            mvo_id = %mvo.id,
            cso_id = %cso.id,
            connected_system = %system.name,
            "Provisioning new connected system object"
        );
        Ok(Some((cso, export)))
    }
}

#[async_trait]
impl ExportEvaluator for RuleBasedExportEvaluator {
    #[instrument(skip(self, mvo, changed, removed, ctx), fields(mvo_id = %mvo.id))]
    async fn evaluate_export_rules(
        &self,
        mvo: &MetaverseObject,
        changed: &[MetaverseAttributeId],
        removed: &[MetaverseAttributeId],
        ctx: &ExportContext<'_>,
    ) -> SyncResult<ExportEvaluation> {
        let mut evaluation = ExportEvaluation::default();
        let mv_type = ctx
            .object_types
            .get(&mvo.type_id)
            .ok_or_else(|| SyncError::missing_schema("metaverse object type", mvo.type_id))?;

        for rule in ctx.rules_for(mvo) {
            if !groups_match(&rule.metaverse_scoping_criteria_groups, &mvo.attribute_values) {
                continue;
            }
            let system = ctx
                .connected_systems
                .get(&rule.connected_system_id)
                .ok_or_else(|| SyncError::missing_schema("connected system", rule.connected_system_id))?;

            let Some(target) = ctx.joined_in(mvo.id, system.id) else {
                if rule.provision_to_connected_system {
                    if let Some((cso, export)) = Self::provision(rule, system, mvo, mv_type, ctx)? {
                        evaluation.provisioning_csos.push(cso);
                        evaluation.pending_exports.push(export);
                    }
                }
                continue;
            };

            if target.is_obsolete() {
                continue;
            }

            let cs_type = system.object_type(target.type_id).ok_or_else(|| {
                SyncError::missing_schema("connected system object type", target.type_id)
            })?;
            let input = ExportFlowInput {
                mvo,
                mv_type,
                target_system: system.id,
                references: ctx.references,
                expressions: ctx.expressions,
                exclude_contributed_by: None,
            };

            let mut expected_values = Vec::new();
            for flow in rule.attribute_flow_rules.iter().filter(|f| {
                f.is_expression()
                    || changed.contains(&f.metaverse_attribute_id)
                    || removed.contains(&f.metaverse_attribute_id)
            }) {
                let Some(attribute) = cs_type.attribute(flow.connected_system_attribute_id) else {
                    continue;
                };
                let Some(expected) = export_flow_values(flow, attribute, &input)? else {
                    debug!(
                        rule = %rule.name,
                        attribute = %attribute.name,
                        "Reference target not present in connected system, skipping"
                    );
                    continue;
                };
                expected_values.push((attribute, expected));
            }

            let pending = ctx.pending_exports.get(&target.id).filter(|e| e.is_pending());

            // Not yet created in the target: the Create carries whole values.
            if let Some(create) =
                pending.filter(|e| e.change_type == PendingExportChangeType::Create)
            {
                let mut merged = create.clone();
                let mut modified = false;
                for (attribute, expected) in expected_values {
                    modified |= merged.replace_added_values(attribute.id, expected);
                }
                if modified {
                    debug!(cso_id = %target.id, "Folded changes into pending create");
                    evaluation.updated_exports.push(merged);
                } else {
                    evaluation.no_net_change_count += 1;
                }
                continue;
            }

            let mut changes = Vec::new();
            for (attribute, expected) in &expected_values {
                let live = target.effective_values(attribute.id);
                changes.extend(attribute_changes(
                    attribute.id,
                    attribute.is_multi_valued(),
                    expected,
                    &live,
                ));
            }

            if changes.is_empty() {
                evaluation.no_net_change_count += 1;
                continue;
            }

            match pending {
                Some(existing) => {
                    let mut merged = existing.clone();
                    merged.merge_changes(changes);
                    evaluation.updated_exports.push(merged);
                }
                None => {
                    evaluation.pending_exports.push(
                        PendingExport::new(system.id, target.id, PendingExportChangeType::Update)
                            .with_changes(changes)
                            .with_source(mvo.id),
                    );
                }
            }
        }

        Ok(evaluation)
    }

    #[instrument(skip(self, mvo, ctx), fields(mvo_id = %mvo.id))]
    async fn evaluate_out_of_scope_exports(
        &self,
        mvo: &MetaverseObject,
        ctx: &ExportContext<'_>,
    ) -> SyncResult<Vec<PendingExport>> {
        let mut exports = Vec::new();
        for rule in ctx.rules_for(mvo) {
            if rule.metaverse_scoping_criteria_groups.is_empty()
                || groups_match(&rule.metaverse_scoping_criteria_groups, &mvo.attribute_values)
            {
                continue;
            }
            let Some(target) = ctx.joined_in(mvo.id, rule.connected_system_id) else {
                continue;
            };
            if target.status != ConnectedSystemObjectStatus::Normal {
                continue;
            }
            let already_deleting = ctx
                .pending_exports
                .get(&target.id)
                .is_some_and(|e| e.change_type == PendingExportChangeType::Delete);
            if already_deleting {
                continue;
            }
            debug!(rule = %rule.name, cso_id = %target.id, "Object left export scope");
            exports.push(
                PendingExport::new(rule.connected_system_id, target.id, PendingExportChangeType::Delete)
                    .with_source(mvo.id),
            );
        }
        Ok(exports)
    }

    async fn evaluate_deletion_exports(
        &self,
        mvo: &MetaverseObject,
        ctx: &ExportContext<'_>,
    ) -> SyncResult<Vec<PendingExport>> {
        let Some(joined) = ctx.joined.get(&mvo.id) else {
            return Ok(Vec::new());
        };
        Ok(joined
            .iter()
            .filter(|c| c.metaverse_object_id == Some(mvo.id))
            .filter(|c| c.status == ConnectedSystemObjectStatus::Normal)
            .filter(|c| ctx.exports_type_to(c.connected_system_id, mvo.type_id))
            .map(|c| {
                PendingExport::new(c.connected_system_id, c.id, PendingExportChangeType::Delete)
                    .with_source(mvo.id)
            })
            .collect())
    }
}
