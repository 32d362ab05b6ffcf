//! Drift detection for enforced export rules.
//!
//! A joined object drifts when its live values differ from what its
//! enforcing export rules derive from the metaverse object. Drift is
//! corrected by staging a pending export; the object itself is never
//! modified here.

use std::collections::HashMap;

use tracing::{debug, instrument};
use xavyo_metaverse::{
    ConnectedSystem, ConnectedSystemAttributeId, ConnectedSystemId, ConnectedSystemObject,
    MetaverseAttributeId, MetaverseObject, MetaverseObjectType, PendingExport,
    PendingExportChangeType, SyncRule, SyncRuleId,
};

use crate::error::{SyncError, SyncResult};
use crate::export::{attribute_changes, export_flow_values, ExportFlowInput, ExportReferenceMap};
use crate::expression::ExpressionEvaluator;
use crate::scope::groups_match;

/// One import flow feeding a metaverse attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportMapping {
    pub sync_rule_id: SyncRuleId,
    pub connected_system_attribute_id: ConnectedSystemAttributeId,
    pub expression: Option<String>,
}

/// Which connected systems legitimately import into which metaverse attributes.
///
/// Built once per run from the enabled import rules of every system, so a
/// system that only receives exports is still judged against the systems
/// that actually source an attribute.
#[derive(Debug, Clone, Default)]
pub struct ImportContributorCache {
    contributors: HashMap<(ConnectedSystemId, MetaverseAttributeId), Vec<ImportMapping>>,
}

impl ImportContributorCache {
    #[must_use]
    pub fn build(rules: &[SyncRule]) -> Self {
        let mut contributors: HashMap<_, Vec<ImportMapping>> = HashMap::new();
        for rule in rules.iter().filter(|r| r.enabled && r.is_import()) {
            for flow in &rule.attribute_flow_rules {
                contributors
                    .entry((rule.connected_system_id, flow.metaverse_attribute_id))
                    .or_default()
                    .push(ImportMapping {
                        sync_rule_id: rule.id,
                        connected_system_attribute_id: flow.connected_system_attribute_id,
                        expression: flow.expression.clone(),
                    });
            }
        }
        Self { contributors }
    }

    #[must_use]
    pub fn is_contributor(&self, system_id: ConnectedSystemId, attribute_id: MetaverseAttributeId) -> bool {
        self.contributors.contains_key(&(system_id, attribute_id))
    }

    #[must_use]
    pub fn mappings(&self, system_id: ConnectedSystemId, attribute_id: MetaverseAttributeId) -> &[ImportMapping] {
        self.contributors
            .get(&(system_id, attribute_id))
            .map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contributors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contributors.is_empty()
    }
}

/// Inputs for drift evaluation of one object.
pub struct DriftContext<'a> {
    pub system: &'a ConnectedSystem,
    pub mv_type: &'a MetaverseObjectType,
    /// Enabled export rules; those not enforcing state for the object are ignored.
    pub export_rules: &'a [SyncRule],
    pub contributors: &'a ImportContributorCache,
    pub references: &'a ExportReferenceMap,
    pub expressions: &'a dyn ExpressionEvaluator,
}

/// Attributes found drifted and the export correcting them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftResult {
    pub drifted_attributes: Vec<ConnectedSystemAttributeId>,
    pub corrective_export: Option<PendingExport>,
}

impl DriftResult {
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drifted_attributes.is_empty()
    }
}

/// Whether any export rule enforces state on objects of a connected system.
#[must_use]
pub fn has_enforcing_rules(system_id: ConnectedSystemId, export_rules: &[SyncRule]) -> bool {
    export_rules
        .iter()
        .any(|r| r.enabled && r.is_export() && r.enforce_state && r.connected_system_id == system_id)
}

/// Compare a joined object against the state its enforcing export rules imply.
///
/// Attributes its own system imports into the metaverse are never drift.
/// Values the system contributed are also left out of the expected set, so
/// multi-valued attributes sourced by several systems are judged per value.
#[instrument(skip_all, fields(cso_id = %cso.id, mvo_id = %mvo.id))]
pub fn evaluate_drift(
    cso: &ConnectedSystemObject,
    mvo: &MetaverseObject,
    ctx: &DriftContext<'_>,
) -> SyncResult<DriftResult> {
    let mut result = DriftResult::default();
    if cso.is_obsolete() || cso.metaverse_object_id != Some(mvo.id) {
        return Ok(result);
    }

    let cs_type = ctx
        .system
        .object_type(cso.type_id)
        .ok_or_else(|| SyncError::missing_schema("connected system object type", cso.type_id))?;
    let input = ExportFlowInput {
        mvo,
        mv_type: ctx.mv_type,
        target_system: cso.connected_system_id,
        references: ctx.references,
        expressions: ctx.expressions,
        exclude_contributed_by: Some(cso.connected_system_id),
    };

    let enforcing = ctx.export_rules.iter().filter(|r| {
        r.enabled
            && r.is_export()
            && r.enforce_state
            && r.connected_system_id == cso.connected_system_id
            && r.connected_system_object_type_id == cso.type_id
            && r.metaverse_object_type_id == mvo.type_id
    });

    let mut changes = Vec::new();
    for rule in enforcing {
        if !groups_match(&rule.metaverse_scoping_criteria_groups, &mvo.attribute_values) {
            continue;
        }
        for flow in &rule.attribute_flow_rules {
            if ctx
                .contributors
                .is_contributor(cso.connected_system_id, flow.metaverse_attribute_id)
            {
                continue;
            }
            if result.drifted_attributes.contains(&flow.connected_system_attribute_id) {
                continue;
            }
            let Some(attribute) = cs_type.attribute(flow.connected_system_attribute_id) else {
                continue;
            };
            let Some(expected) = export_flow_values(flow, attribute, &input)? else {
                continue;
            };
            let live = cso.effective_values(attribute.id);
            let corrections =
                attribute_changes(attribute.id, attribute.is_multi_valued(), &expected, &live);
            if corrections.is_empty() {
                continue;
            }

            debug!(
                rule = %rule.name,
                attribute = %attribute.name,
                expected = expected.len(),
                live = live.len(),
                "Attribute drifted from enforced state"
            );
            result.drifted_attributes.push(attribute.id);
            changes.extend(corrections);
        }
    }

    if !changes.is_empty() {
        result.corrective_export = Some(
            PendingExport::new(cso.connected_system_id, cso.id, PendingExportChangeType::Update)
                .with_changes(changes)
                .with_source(mvo.id),
        );
    }
    Ok(result)
}
