//! Scope evaluation.
//!
//! A rule with no scoping groups matches every object. Otherwise each
//! top-level group must match; inside a group, `All` requires every
//! criterion and child group to match and `Any` requires at least one.
//! Text comparisons are case-sensitive.

use std::cmp::Ordering;
use std::hash::Hash;

use xavyo_metaverse::{
    AttributeValue, AttributeValues, ConnectedSystemObject, InboundOutOfScopeAction,
    ScopingComparison, ScopingCriteriaGroup, ScopingCriterion, ScopingGroupType, SyncRule,
};

/// Result of scoping one object against its applicable import rules.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeDecision<'a> {
    /// No enabled import rule targets the object's type.
    NoApplicableRules,
    /// Rules the object is in scope of, in configuration order.
    InScope(Vec<&'a SyncRule>),
    /// The object is out of scope of every applicable rule.
    OutOfScope(InboundOutOfScopeAction),
}

/// Whether an object satisfies an import rule's scoping criteria.
///
/// Staged import deltas are taken into account.
#[must_use]
pub fn in_scope(cso: &ConnectedSystemObject, rule: &SyncRule) -> bool {
    if !rule.has_scoping_criteria() {
        return true;
    }
    let values = cso.effective_attribute_values();
    groups_match(&rule.object_scoping_criteria_groups, &values)
}

/// Whether a value set satisfies every top-level group.
#[must_use]
pub fn groups_match<A>(groups: &[ScopingCriteriaGroup<A>], values: &AttributeValues<A>) -> bool
where
    A: Copy + Eq + Hash,
{
    groups.iter().all(|group| group_matches(group, values))
}

/// Scope an object against every import rule that applies to it.
///
/// When the object is out of scope, `RemainJoined` wins if any applicable
/// rule asks for it.
#[must_use]
pub fn evaluate_scope<'a>(cso: &ConnectedSystemObject, import_rules: &'a [SyncRule]) -> ScopeDecision<'a> {
    let applicable: Vec<&SyncRule> = import_rules
        .iter()
        .filter(|r| r.is_import() && r.applies_to(cso))
        .collect();

    if applicable.is_empty() {
        return ScopeDecision::NoApplicableRules;
    }

    let matched: Vec<&SyncRule> = applicable
        .iter()
        .copied()
        .filter(|r| in_scope(cso, r))
        .collect();

    if !matched.is_empty() {
        return ScopeDecision::InScope(matched);
    }

    let remain = applicable
        .iter()
        .any(|r| r.inbound_out_of_scope_action == InboundOutOfScopeAction::RemainJoined);
    ScopeDecision::OutOfScope(if remain {
        InboundOutOfScopeAction::RemainJoined
    } else {
        InboundOutOfScopeAction::Disconnect
    })
}

fn group_matches<A>(group: &ScopingCriteriaGroup<A>, values: &AttributeValues<A>) -> bool
where
    A: Copy + Eq + Hash,
{
    if group.criteria.is_empty() && group.child_groups.is_empty() {
        return true;
    }

    let mut results = group
        .criteria
        .iter()
        .map(|c| criterion_matches(c, values))
        .chain(group.child_groups.iter().map(|g| group_matches(g, values)));

    match group.group_type {
        ScopingGroupType::All => results.all(|r| r),
        ScopingGroupType::Any => results.any(|r| r),
    }
}

fn criterion_matches<A>(criterion: &ScopingCriterion<A>, values: &AttributeValues<A>) -> bool
where
    A: Copy + Eq + Hash,
{
    let mut present = values.values_of(criterion.attribute_id).peekable();

    match criterion.comparison {
        ScopingComparison::IsPresent => return present.peek().is_some(),
        ScopingComparison::IsNotPresent => return present.peek().is_none(),
        _ => {}
    }

    let Some(operand) = criterion.value.as_ref() else {
        return false;
    };

    match criterion.comparison {
        ScopingComparison::Equals => present.any(|v| v == operand),
        ScopingComparison::NotEquals => present.all(|v| v != operand),
        ScopingComparison::StartsWith => text_match(present, operand, |v, o| v.starts_with(o)),
        ScopingComparison::EndsWith => text_match(present, operand, |v, o| v.ends_with(o)),
        ScopingComparison::Contains => text_match(present, operand, |v, o| v.contains(o)),
        ScopingComparison::NotContains => {
            !text_match(present, operand, |v, o| v.contains(o))
        }
        ScopingComparison::LessThan => {
            present.any(|v| compare(v, operand) == Some(Ordering::Less))
        }
        ScopingComparison::LessThanOrEqual => present.any(|v| {
            matches!(compare(v, operand), Some(Ordering::Less | Ordering::Equal))
        }),
        ScopingComparison::GreaterThan => {
            present.any(|v| compare(v, operand) == Some(Ordering::Greater))
        }
        ScopingComparison::GreaterThanOrEqual => present.any(|v| {
            matches!(compare(v, operand), Some(Ordering::Greater | Ordering::Equal))
        }),
        ScopingComparison::IsPresent | ScopingComparison::IsNotPresent => false,
    }
}

fn text_match<'v>(
    mut values: impl Iterator<Item = &'v AttributeValue>,
    operand: &AttributeValue,
    predicate: impl Fn(&str, &str) -> bool,
) -> bool {
    let Some(operand) = operand.as_text() else {
        return false;
    };
    values.any(|v| v.as_text().is_some_and(|text| predicate(text, operand)))
}

/// Order two values of comparable types.
fn compare(left: &AttributeValue, right: &AttributeValue) -> Option<Ordering> {
    match (left, right) {
        (AttributeValue::Number(a), AttributeValue::Number(b)) => Some(a.cmp(b)),
        (AttributeValue::LongNumber(a), AttributeValue::LongNumber(b)) => Some(a.cmp(b)),
        (AttributeValue::Number(a), AttributeValue::LongNumber(b)) => Some(i64::from(*a).cmp(b)),
        (AttributeValue::LongNumber(a), AttributeValue::Number(b)) => Some(a.cmp(&i64::from(*b))),
        (AttributeValue::DateTime(a), AttributeValue::DateTime(b)) => Some(a.cmp(b)),
        (AttributeValue::Text(a), AttributeValue::Text(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
