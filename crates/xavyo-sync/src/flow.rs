//! Inbound attribute flow (connected system object to metaverse object).
//!
//! Flow never writes values directly: it stages additions and removals on
//! the metaverse object, which are merged by
//! [`MetaverseObject::apply_pending_changes`] when the page is flushed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use xavyo_metaverse::{
    AttributeFlowRule, AttributeValue, ConnectedSystemObject, ConnectedSystemObjectId,
    ConnectedSystemObjectType, MetaverseAttributeId, MetaverseError, MetaverseObject,
    MetaverseObjectId, MetaverseObjectType, MvoAttributeEntry, Reference, SyncRule,
};

use crate::error::{SyncError, SyncResult};
use crate::expression::{ExpressionContext, ExpressionEvaluator};

/// Which attributes a flow pass handles.
///
/// References are flowed only after every object of the page has a
/// metaverse object, so they run in a separate pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowPass {
    NonReference,
    ReferenceOnly,
}

impl std::fmt::Display for FlowPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonReference => write!(f, "non_reference"),
            Self::ReferenceOnly => write!(f, "reference_only"),
        }
    }
}

/// What a flow staged on the metaverse object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowOutcome {
    /// Values staged for addition.
    pub additions: usize,
    /// Values staged for removal.
    pub removals: usize,
    /// Referenced objects that have no metaverse object yet.
    pub unresolved: Vec<ConnectedSystemObjectId>,
    /// Reference values that can never resolve (raw, unmatched text).
    pub dangling: Vec<String>,
}

impl FlowOutcome {
    #[must_use]
    pub fn unresolved(ids: Vec<ConnectedSystemObjectId>) -> Self {
        Self {
            unresolved: ids,
            ..Self::default()
        }
    }

    /// Number of value changes staged.
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.additions + self.removals
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.value_count() > 0
    }

    #[must_use]
    pub fn has_unresolved_references(&self) -> bool {
        !self.unresolved.is_empty()
    }

    pub fn merge(&mut self, other: FlowOutcome) {
        self.additions += other.additions;
        self.removals += other.removals;
        for id in other.unresolved {
            if !self.unresolved.contains(&id) {
                self.unresolved.push(id);
            }
        }
        self.dangling.extend(other.dangling);
    }
}

/// Values to add to and remove from a target so it equals a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueDiff {
    pub additions: Vec<AttributeValue>,
    pub removals: Vec<AttributeValue>,
}

impl ValueDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

/// Set difference between a source value set and a target value set.
///
/// Values present on both sides are left alone. Duplicate source values
/// are added once.
#[must_use]
pub fn diff_values(source: &[AttributeValue], target: &[AttributeValue]) -> ValueDiff {
    let mut additions: Vec<AttributeValue> = Vec::new();
    for value in source {
        if !target.contains(value) && !additions.contains(value) {
            additions.push(value.clone());
        }
    }
    let removals = target
        .iter()
        .filter(|v| !source.contains(v))
        .cloned()
        .collect();
    ValueDiff {
        additions,
        removals,
    }
}

/// Connected system object to metaverse object lookups for reference values.
///
/// Built once per page from the page's own objects first and storage second.
#[derive(Debug, Clone, Default)]
pub struct ReferenceResolver {
    joins: HashMap<ConnectedSystemObjectId, MetaverseObjectId>,
}

impl ReferenceResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cso_id: ConnectedSystemObjectId, mvo_id: MetaverseObjectId) {
        self.joins.insert(cso_id, mvo_id);
    }

    #[must_use]
    pub fn contains(&self, cso_id: ConnectedSystemObjectId) -> bool {
        self.joins.contains_key(&cso_id)
    }

    /// The metaverse object a reference points at, if known.
    #[must_use]
    pub fn resolve(&self, reference: &Reference) -> Option<MetaverseObjectId> {
        match reference {
            Reference::MetaverseObject(id) => Some(*id),
            Reference::ConnectedSystemObject(id) => self.joins.get(id).copied(),
            Reference::Unresolved(_) => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.joins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }
}

/// Connected system objects referenced by an object's effective values.
#[must_use]
pub fn referenced_objects(cso: &ConnectedSystemObject) -> Vec<ConnectedSystemObjectId> {
    let mut ids = Vec::new();
    for entry in cso
        .attribute_values
        .iter()
        .chain(cso.pending_attribute_value_additions.iter())
    {
        if let Some(id) = entry
            .value
            .as_reference()
            .and_then(Reference::connected_system_object)
        {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

/// Everything a flow needs besides the two objects.
pub struct FlowContext<'a> {
    pub cs_type: &'a ConnectedSystemObjectType,
    pub mv_type: &'a MetaverseObjectType,
    pub references: &'a ReferenceResolver,
    pub expressions: &'a dyn ExpressionEvaluator,
}

/// Whether a flow moves reference values.
fn is_reference_flow(flow: &AttributeFlowRule, ctx: &FlowContext<'_>) -> bool {
    if !flow.is_expression() {
        if let Some(source) = ctx.cs_type.attribute(flow.connected_system_attribute_id) {
            return source.is_reference();
        }
    }
    ctx.mv_type
        .attribute(flow.metaverse_attribute_id)
        .is_some_and(|a| a.is_reference())
}

/// Values an attribute will hold once staged deltas are merged.
pub(crate) fn projected_values(mvo: &MetaverseObject, attribute_id: MetaverseAttributeId) -> Vec<AttributeValue> {
    let mut values: Vec<AttributeValue> = mvo.attribute_values.values_of(attribute_id).cloned().collect();
    for removal in mvo
        .pending_attribute_value_removals
        .iter()
        .filter(|e| e.attribute_id == attribute_id)
    {
        if let Some(index) = values.iter().position(|v| v == &removal.value) {
            values.remove(index);
        }
    }
    values.extend(
        mvo.pending_attribute_value_additions
            .iter()
            .filter(|e| e.attribute_id == attribute_id)
            .map(|e| e.value.clone()),
    );
    values
}

/// Apply one attribute flow rule, staging the difference on the metaverse object.
pub fn flow_attribute(
    rule: &SyncRule,
    flow: &AttributeFlowRule,
    cso: &ConnectedSystemObject,
    mvo: &mut MetaverseObject,
    ctx: &FlowContext<'_>,
) -> SyncResult<FlowOutcome> {
    let target = ctx.mv_type.attribute(flow.metaverse_attribute_id).ok_or_else(|| {
        SyncError::MalformedSyncRule(MetaverseError::MissingTargetAttribute {
            rule: rule.name.clone(),
            attribute: flow.metaverse_attribute_id.to_string(),
        })
    })?;

    let mut source = match &flow.expression {
        Some(expression) => {
            let context = ExpressionContext::from_values(
                &cso.effective_attribute_values(),
                &ctx.cs_type.attributes,
            );
            ctx.expressions
                .evaluate(expression, &context, target.data_type)?
                .into_values()
        }
        None => {
            if ctx.cs_type.attribute(flow.connected_system_attribute_id).is_none() {
                return Err(SyncError::MalformedSyncRule(MetaverseError::UnknownAttribute {
                    rule: rule.name.clone(),
                    attribute: flow.connected_system_attribute_id.to_string(),
                }));
            }
            cso.effective_values(flow.connected_system_attribute_id)
        }
    };

    let mut outcome = FlowOutcome::default();

    if target.is_reference() {
        let mut resolved = Vec::with_capacity(source.len());
        for value in source {
            match value.as_reference() {
                Some(reference) => match ctx.references.resolve(reference) {
                    Some(mvo_id) => resolved.push(AttributeValue::metaverse_reference(mvo_id)),
                    None => match reference {
                        Reference::ConnectedSystemObject(id) => outcome.unresolved.push(*id),
                        Reference::Unresolved(raw) => outcome.dangling.push(raw.clone()),
                        Reference::MetaverseObject(_) => {}
                    },
                },
                None => resolved.push(value),
            }
        }
        source = resolved;
    }

    if !target.is_multi_valued() {
        source.truncate(1);
    }

    let current = projected_values(mvo, target.id);
    let mut diff = diff_values(&source, &current);

    if !outcome.unresolved.is_empty() || !outcome.dangling.is_empty() {
        // Partial knowledge: only additions are safe.
        diff.removals.clear();
    }

    for value in diff.removals {
        stage_removal(mvo, target.id, value);
        outcome.removals += 1;
    }
    for value in diff.additions {
        stage_addition(mvo, target.id, value, cso);
        outcome.additions += 1;
    }

    Ok(outcome)
}

/// Apply every flow of an import rule that belongs to the given pass.
pub fn flow_import_rule(
    rule: &SyncRule,
    cso: &ConnectedSystemObject,
    mvo: &mut MetaverseObject,
    pass: FlowPass,
    ctx: &FlowContext<'_>,
) -> SyncResult<FlowOutcome> {
    let mut outcome = FlowOutcome::default();
    for flow in &rule.attribute_flow_rules {
        let reference = is_reference_flow(flow, ctx);
        let selected = match pass {
            FlowPass::NonReference => !reference,
            FlowPass::ReferenceOnly => reference,
        };
        if !selected {
            continue;
        }
        outcome.merge(flow_attribute(rule, flow, cso, mvo, ctx)?);
    }

    if outcome.has_changes() {
        debug!(
            rule = %rule.name,
            cso_id = %cso.id,
            mvo_id = %mvo.id,
            pass = %pass,
            additions = outcome.additions,
            removals = outcome.removals,
            "Staged attribute flow"
        );
    }
    Ok(outcome)
}

fn stage_removal(mvo: &mut MetaverseObject, attribute_id: MetaverseAttributeId, value: AttributeValue) {
    // A value staged earlier in this page is withdrawn rather than removed.
    if let Some(index) = mvo
        .pending_attribute_value_additions
        .iter()
        .position(|e| e.attribute_id == attribute_id && e.value == value)
    {
        mvo.pending_attribute_value_additions.remove(index);
        return;
    }
    mvo.stage_removal(MvoAttributeEntry::new(attribute_id, value));
}

fn stage_addition(
    mvo: &mut MetaverseObject,
    attribute_id: MetaverseAttributeId,
    value: AttributeValue,
    cso: &ConnectedSystemObject,
) {
    if let Some(index) = mvo
        .pending_attribute_value_removals
        .iter()
        .position(|e| e.attribute_id == attribute_id && e.value == value)
    {
        mvo.pending_attribute_value_removals.remove(index);
        return;
    }
    mvo.stage_addition(
        MvoAttributeEntry::new(attribute_id, value).contributed_by(Some(cso.connected_system_id)),
    );
}
