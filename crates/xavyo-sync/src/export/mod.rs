//! Outbound side: export evaluation and pending export confirmation.

mod confirmation;
mod evaluator;

pub use confirmation::{confirm_pending_exports, ConfirmationOutcome};
pub use evaluator::{ExportContext, ExportEvaluation, ExportEvaluator, RuleBasedExportEvaluator};

use std::collections::HashMap;

use xavyo_metaverse::{
    AttributeFlowRule, AttributeValue, AttributeValueChange, ConnectedSystemAttribute,
    ConnectedSystemAttributeId, ConnectedSystemId, ConnectedSystemObjectId, MetaverseObject,
    MetaverseObjectId, MetaverseObjectType, Reference,
};

use crate::error::SyncResult;
use crate::expression::{ExpressionContext, ExpressionEvaluator};

/// Where a metaverse object is represented in each connected system.
///
/// Used to turn metaverse references into connected system references.
#[derive(Debug, Clone, Default)]
pub struct ExportReferenceMap {
    targets: HashMap<(MetaverseObjectId, ConnectedSystemId), ConnectedSystemObjectId>,
}

impl ExportReferenceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        mvo_id: MetaverseObjectId,
        system_id: ConnectedSystemId,
        cso_id: ConnectedSystemObjectId,
    ) {
        self.targets.insert((mvo_id, system_id), cso_id);
    }

    #[must_use]
    pub fn resolve(
        &self,
        mvo_id: MetaverseObjectId,
        system_id: ConnectedSystemId,
    ) -> Option<ConnectedSystemObjectId> {
        self.targets.get(&(mvo_id, system_id)).copied()
    }
}

/// Metaverse objects referenced by an object's values.
#[must_use]
pub fn referenced_metaverse_objects(mvo: &MetaverseObject) -> Vec<MetaverseObjectId> {
    let mut ids = Vec::new();
    for id in mvo
        .attribute_values
        .iter()
        .filter_map(|e| e.value.as_reference().and_then(Reference::metaverse_object))
    {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Inputs for computing the values an export flow asserts on a target.
pub(crate) struct ExportFlowInput<'a> {
    pub mvo: &'a MetaverseObject,
    pub mv_type: &'a MetaverseObjectType,
    pub target_system: ConnectedSystemId,
    pub references: &'a ExportReferenceMap,
    pub expressions: &'a dyn ExpressionEvaluator,
    /// Leave out metaverse values this system contributed itself.
    pub exclude_contributed_by: Option<ConnectedSystemId>,
}

/// Values an export flow asserts on the target attribute.
///
/// Returns `None` when a reference cannot be mapped into the target system,
/// in which case the attribute is left alone.
pub(crate) fn export_flow_values(
    flow: &AttributeFlowRule,
    target: &ConnectedSystemAttribute,
    input: &ExportFlowInput<'_>,
) -> SyncResult<Option<Vec<AttributeValue>>> {
    let mut values: Vec<AttributeValue> = match &flow.expression {
        Some(expression) => {
            let context =
                ExpressionContext::from_values(&input.mvo.attribute_values, &input.mv_type.attributes);
            input
                .expressions
                .evaluate(expression, &context, target.data_type)?
                .into_values()
        }
        None => input
            .mvo
            .attribute_values
            .entries_of(flow.metaverse_attribute_id)
            .filter(|e| {
                input
                    .exclude_contributed_by
                    .map_or(true, |system| e.contributed_by != Some(system))
            })
            .map(|e| e.value.clone())
            .collect(),
    };

    if target.is_reference() {
        let mut mapped = Vec::with_capacity(values.len());
        for value in values {
            match value.as_reference() {
                Some(Reference::MetaverseObject(mvo_id)) => {
                    match input.references.resolve(*mvo_id, input.target_system) {
                        Some(cso_id) => mapped.push(AttributeValue::connected_system_reference(cso_id)),
                        None => return Ok(None),
                    }
                }
                _ => mapped.push(value),
            }
        }
        values = mapped;
    }

    if !target.is_multi_valued() {
        values.truncate(1);
    }
    Ok(Some(values))
}

/// Attribute changes that bring `live` to `expected`.
///
/// Multi-valued attributes get value adds and removes; single-valued
/// attributes are replaced, or cleared when nothing is expected.
#[must_use]
pub fn attribute_changes(
    attribute_id: ConnectedSystemAttributeId,
    multi_valued: bool,
    expected: &[AttributeValue],
    live: &[AttributeValue],
) -> Vec<AttributeValueChange> {
    let diff = crate::flow::diff_values(expected, live);
    if diff.is_empty() {
        return Vec::new();
    }

    if multi_valued {
        let mut changes: Vec<AttributeValueChange> = diff
            .additions
            .into_iter()
            .map(|v| AttributeValueChange::add(attribute_id, v))
            .collect();
        changes.extend(
            diff.removals
                .into_iter()
                .map(|v| AttributeValueChange::remove(attribute_id, v)),
        );
        return changes;
    }

    match expected.first() {
        Some(value) => vec![AttributeValueChange::update(attribute_id, value.clone())],
        None => vec![AttributeValueChange::remove_all(attribute_id)],
    }
}
