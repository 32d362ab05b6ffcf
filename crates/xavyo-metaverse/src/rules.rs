//! Synchronization rules.
//!
//! An import rule flows values from a connected system object type into a
//! metaverse object type. An export rule flows them back out.

use serde::{Deserialize, Serialize};

use crate::error::{MetaverseError, MetaverseResult};
use crate::ids::{
    ConnectedSystemAttributeId, ConnectedSystemId, ConnectedSystemObjectTypeId,
    MetaverseAttributeId, MetaverseObjectTypeId, SyncRuleId,
};
use crate::objects::ConnectedSystemObject;
use crate::schema::{ConnectedSystemObjectType, MetaverseObjectType};
use crate::value::AttributeValue;

/// Flow direction of a sync rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRuleDirection {
    Import,
    Export,
}

impl SyncRuleDirection {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRuleDirection::Import => "import",
            SyncRuleDirection::Export => "export",
        }
    }
}

impl std::fmt::Display for SyncRuleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SyncRuleDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "import" => Ok(SyncRuleDirection::Import),
            "export" => Ok(SyncRuleDirection::Export),
            _ => Err(format!("Unknown sync rule direction: {s}")),
        }
    }
}

/// What happens to a joined object that falls out of an import rule's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundOutOfScopeAction {
    /// Break the join and run deletion-rule evaluation.
    #[default]
    Disconnect,
    /// Keep the join; stop flowing attributes.
    RemainJoined,
}

impl InboundOutOfScopeAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundOutOfScopeAction::Disconnect => "disconnect",
            InboundOutOfScopeAction::RemainJoined => "remain_joined",
        }
    }
}

impl std::str::FromStr for InboundOutOfScopeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disconnect" => Ok(InboundOutOfScopeAction::Disconnect),
            "remain_joined" => Ok(InboundOutOfScopeAction::RemainJoined),
            _ => Err(format!("Unknown out-of-scope action: {s}")),
        }
    }
}

/// One attribute mapping of a sync rule.
///
/// For import rules the connected system attribute is the source and the
/// metaverse attribute the target; export rules reverse that. When
/// `expression` is set it replaces the direct source attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeFlowRule {
    pub connected_system_attribute_id: ConnectedSystemAttributeId,
    pub metaverse_attribute_id: MetaverseAttributeId,
    #[serde(default)]
    pub expression: Option<String>,
}

impl AttributeFlowRule {
    #[must_use]
    pub fn direct(
        connected_system_attribute_id: ConnectedSystemAttributeId,
        metaverse_attribute_id: MetaverseAttributeId,
    ) -> Self {
        Self {
            connected_system_attribute_id,
            metaverse_attribute_id,
            expression: None,
        }
    }

    #[must_use]
    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    #[must_use]
    pub fn is_expression(&self) -> bool {
        self.expression.is_some()
    }
}

/// Equality match between a connected system attribute and a metaverse attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMatchingRule {
    pub connected_system_attribute_id: ConnectedSystemAttributeId,
    pub metaverse_attribute_id: MetaverseAttributeId,
}

/// How the members of a scoping group combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopingGroupType {
    #[default]
    All,
    Any,
}

/// Comparison performed by a scoping criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopingComparison {
    Equals,
    NotEquals,
    StartsWith,
    EndsWith,
    Contains,
    NotContains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    IsPresent,
    IsNotPresent,
}

impl ScopingComparison {
    /// Whether the comparison needs an operand value.
    #[must_use]
    pub fn requires_value(&self) -> bool {
        !matches!(self, ScopingComparison::IsPresent | ScopingComparison::IsNotPresent)
    }
}

/// A single scoping predicate over one attribute.
///
/// Import rules scope on connected system attributes; export rules may also
/// scope on metaverse attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopingCriterion<A = ConnectedSystemAttributeId> {
    pub attribute_id: A,
    pub comparison: ScopingComparison,
    #[serde(default)]
    pub value: Option<AttributeValue>,
}

impl<A> ScopingCriterion<A> {
    #[must_use]
    pub fn new(attribute_id: A, comparison: ScopingComparison, value: impl Into<AttributeValue>) -> Self {
        Self {
            attribute_id,
            comparison,
            value: Some(value.into()),
        }
    }

    #[must_use]
    pub fn presence(attribute_id: A, comparison: ScopingComparison) -> Self {
        Self {
            attribute_id,
            comparison,
            value: None,
        }
    }
}

/// A group of scoping criteria with nested child groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopingCriteriaGroup<A = ConnectedSystemAttributeId> {
    #[serde(default)]
    pub group_type: ScopingGroupType,
    #[serde(default = "Vec::new")]
    pub criteria: Vec<ScopingCriterion<A>>,
    #[serde(default = "Vec::new")]
    pub child_groups: Vec<ScopingCriteriaGroup<A>>,
}

impl<A> ScopingCriteriaGroup<A> {
    #[must_use]
    pub fn all(criteria: Vec<ScopingCriterion<A>>) -> Self {
        Self {
            group_type: ScopingGroupType::All,
            criteria,
            child_groups: Vec::new(),
        }
    }

    #[must_use]
    pub fn any(criteria: Vec<ScopingCriterion<A>>) -> Self {
        Self {
            group_type: ScopingGroupType::Any,
            criteria,
            child_groups: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_child(mut self, group: ScopingCriteriaGroup<A>) -> Self {
        self.child_groups.push(group);
        self
    }
}

/// A declarative mapping between a connected system object type and a
/// metaverse object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRule {
    pub id: SyncRuleId,
    pub name: String,
    pub connected_system_id: ConnectedSystemId,
    pub direction: SyncRuleDirection,
    pub connected_system_object_type_id: ConnectedSystemObjectTypeId,
    pub metaverse_object_type_id: MetaverseObjectTypeId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Import only: create a metaverse object when nothing matches.
    #[serde(default)]
    pub project_to_metaverse: bool,
    /// Export only: create a connected system object when none is joined.
    #[serde(default)]
    pub provision_to_connected_system: bool,
    /// Export only: treat external divergence as drift and correct it.
    #[serde(default)]
    pub enforce_state: bool,
    #[serde(default)]
    pub inbound_out_of_scope_action: InboundOutOfScopeAction,
    /// Import rules: criteria over the connected system object.
    #[serde(default)]
    pub object_scoping_criteria_groups: Vec<ScopingCriteriaGroup>,
    /// Export rules: criteria over the metaverse object.
    #[serde(default)]
    pub metaverse_scoping_criteria_groups: Vec<ScopingCriteriaGroup<MetaverseAttributeId>>,
    #[serde(default)]
    pub object_matching_rules: Vec<ObjectMatchingRule>,
    #[serde(default)]
    pub attribute_flow_rules: Vec<AttributeFlowRule>,
}

fn default_enabled() -> bool {
    true
}

impl SyncRule {
    fn new(
        name: impl Into<String>,
        direction: SyncRuleDirection,
        connected_system_id: ConnectedSystemId,
        connected_system_object_type_id: ConnectedSystemObjectTypeId,
        metaverse_object_type_id: MetaverseObjectTypeId,
    ) -> Self {
        Self {
            id: SyncRuleId::new(),
            name: name.into(),
            connected_system_id,
            direction,
            connected_system_object_type_id,
            metaverse_object_type_id,
            enabled: true,
            project_to_metaverse: false,
            provision_to_connected_system: false,
            enforce_state: false,
            inbound_out_of_scope_action: InboundOutOfScopeAction::Disconnect,
            object_scoping_criteria_groups: Vec::new(),
            metaverse_scoping_criteria_groups: Vec::new(),
            object_matching_rules: Vec::new(),
            attribute_flow_rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn import(
        name: impl Into<String>,
        connected_system_id: ConnectedSystemId,
        connected_system_object_type_id: ConnectedSystemObjectTypeId,
        metaverse_object_type_id: MetaverseObjectTypeId,
    ) -> Self {
        Self::new(
            name,
            SyncRuleDirection::Import,
            connected_system_id,
            connected_system_object_type_id,
            metaverse_object_type_id,
        )
    }

    #[must_use]
    pub fn export(
        name: impl Into<String>,
        connected_system_id: ConnectedSystemId,
        connected_system_object_type_id: ConnectedSystemObjectTypeId,
        metaverse_object_type_id: MetaverseObjectTypeId,
    ) -> Self {
        Self::new(
            name,
            SyncRuleDirection::Export,
            connected_system_id,
            connected_system_object_type_id,
            metaverse_object_type_id,
        )
    }

    #[must_use]
    pub fn projecting(mut self) -> Self {
        self.project_to_metaverse = true;
        self
    }

    #[must_use]
    pub fn provisioning(mut self) -> Self {
        self.provision_to_connected_system = true;
        self
    }

    #[must_use]
    pub fn enforcing(mut self) -> Self {
        self.enforce_state = true;
        self
    }

    #[must_use]
    pub fn with_out_of_scope_action(mut self, action: InboundOutOfScopeAction) -> Self {
        self.inbound_out_of_scope_action = action;
        self
    }

    #[must_use]
    pub fn with_flow(mut self, rule: AttributeFlowRule) -> Self {
        self.attribute_flow_rules.push(rule);
        self
    }

    #[must_use]
    pub fn with_matching(mut self, rule: ObjectMatchingRule) -> Self {
        self.object_matching_rules.push(rule);
        self
    }

    #[must_use]
    pub fn with_scope(mut self, group: ScopingCriteriaGroup) -> Self {
        self.object_scoping_criteria_groups.push(group);
        self
    }

    #[must_use]
    pub fn with_metaverse_scope(mut self, group: ScopingCriteriaGroup<MetaverseAttributeId>) -> Self {
        self.metaverse_scoping_criteria_groups.push(group);
        self
    }

    #[must_use]
    pub fn is_import(&self) -> bool {
        self.direction == SyncRuleDirection::Import
    }

    #[must_use]
    pub fn is_export(&self) -> bool {
        self.direction == SyncRuleDirection::Export
    }

    #[must_use]
    pub fn has_scoping_criteria(&self) -> bool {
        !self.object_scoping_criteria_groups.is_empty()
    }

    /// Whether this rule is enabled and targets the object's system and type.
    #[must_use]
    pub fn applies_to(&self, cso: &ConnectedSystemObject) -> bool {
        self.enabled
            && self.connected_system_id == cso.connected_system_id
            && self.connected_system_object_type_id == cso.type_id
    }

    /// Check every mapped attribute exists in the schemas on both sides.
    pub fn validate(
        &self,
        cs_type: &ConnectedSystemObjectType,
        mv_type: &MetaverseObjectType,
    ) -> MetaverseResult<()> {
        if cs_type.id != self.connected_system_object_type_id {
            return Err(MetaverseError::ObjectTypeMismatch {
                rule: self.name.clone(),
                expected: self.connected_system_object_type_id.to_string(),
                actual: cs_type.id.to_string(),
            });
        }
        if mv_type.id != self.metaverse_object_type_id {
            return Err(MetaverseError::ObjectTypeMismatch {
                rule: self.name.clone(),
                expected: self.metaverse_object_type_id.to_string(),
                actual: mv_type.id.to_string(),
            });
        }

        for flow in &self.attribute_flow_rules {
            let cs_known = cs_type.attribute(flow.connected_system_attribute_id).is_some();
            let mv_known = mv_type.attribute(flow.metaverse_attribute_id).is_some();
            // The source side may be an expression; the target must always exist.
            let (target_known, source_known, target) = match self.direction {
                SyncRuleDirection::Import => (
                    mv_known,
                    cs_known || flow.is_expression(),
                    flow.metaverse_attribute_id.to_string(),
                ),
                SyncRuleDirection::Export => (
                    cs_known,
                    mv_known || flow.is_expression(),
                    flow.connected_system_attribute_id.to_string(),
                ),
            };
            if !target_known {
                return Err(MetaverseError::MissingTargetAttribute {
                    rule: self.name.clone(),
                    attribute: target,
                });
            }
            if !source_known {
                return Err(MetaverseError::UnknownAttribute {
                    rule: self.name.clone(),
                    attribute: match self.direction {
                        SyncRuleDirection::Import => flow.connected_system_attribute_id.to_string(),
                        SyncRuleDirection::Export => flow.metaverse_attribute_id.to_string(),
                    },
                });
            }
        }

        for matching in &self.object_matching_rules {
            if cs_type.attribute(matching.connected_system_attribute_id).is_none() {
                return Err(MetaverseError::UnknownAttribute {
                    rule: self.name.clone(),
                    attribute: matching.connected_system_attribute_id.to_string(),
                });
            }
            if mv_type.attribute(matching.metaverse_attribute_id).is_none() {
                return Err(MetaverseError::UnknownAttribute {
                    rule: self.name.clone(),
                    attribute: matching.metaverse_attribute_id.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeDataType, DeletionRule, SchemaAttribute};

    fn schemas() -> (ConnectedSystemObjectType, MetaverseObjectType) {
        let cs_type = ConnectedSystemObjectType {
            id: ConnectedSystemObjectTypeId::new(),
            name: "employee".to_string(),
            attributes: vec![SchemaAttribute::single(
                ConnectedSystemAttributeId::new(),
                "EMPLOYEE_ID",
                AttributeDataType::Text,
            )],
            external_id_attribute_id: None,
            remove_contributed_attributes_on_obsoletion: false,
        };
        let mv_type = MetaverseObjectType {
            id: MetaverseObjectTypeId::new(),
            name: "person".to_string(),
            attributes: vec![SchemaAttribute::single(
                MetaverseAttributeId::new(),
                "EmployeeId",
                AttributeDataType::Text,
            )],
            deletion_rule: DeletionRule::Manual,
            deletion_grace_period: None,
            deletion_trigger_connected_system_ids: vec![],
        };
        (cs_type, mv_type)
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("IMPORT".parse::<SyncRuleDirection>(), Ok(SyncRuleDirection::Import));
        assert!("sideways".parse::<SyncRuleDirection>().is_err());
    }

    #[test]
    fn test_applies_to_requires_system_type_and_enabled() {
        let (cs_type, mv_type) = schemas();
        let system = ConnectedSystemId::new();
        let mut rule = SyncRule::import("hr", system, cs_type.id, mv_type.id);
        let cso = ConnectedSystemObject::new(system, cs_type.id, cs_type.attributes[0].id);
        assert!(rule.applies_to(&cso));

        rule.enabled = false;
        assert!(!rule.applies_to(&cso));

        let other = ConnectedSystemObject::new(ConnectedSystemId::new(), cs_type.id, cs_type.attributes[0].id);
        rule.enabled = true;
        assert!(!rule.applies_to(&other));
    }

    #[test]
    fn test_validate_accepts_known_attributes() {
        let (cs_type, mv_type) = schemas();
        let rule = SyncRule::import("hr", ConnectedSystemId::new(), cs_type.id, mv_type.id).with_flow(
            AttributeFlowRule::direct(cs_type.attributes[0].id, mv_type.attributes[0].id),
        );
        assert!(rule.validate(&cs_type, &mv_type).is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_target() {
        let (cs_type, mv_type) = schemas();
        let rule = SyncRule::import("hr", ConnectedSystemId::new(), cs_type.id, mv_type.id).with_flow(
            AttributeFlowRule::direct(cs_type.attributes[0].id, MetaverseAttributeId::new()),
        );
        let err = rule.validate(&cs_type, &mv_type).unwrap_err();
        assert!(matches!(err, MetaverseError::MissingTargetAttribute { .. }));
    }

    #[test]
    fn test_validate_allows_expression_source() {
        let (cs_type, mv_type) = schemas();
        let rule = SyncRule::import("hr", ConnectedSystemId::new(), cs_type.id, mv_type.id).with_flow(
            AttributeFlowRule::direct(ConnectedSystemAttributeId::new(), mv_type.attributes[0].id)
                .with_expression("\"fixed\""),
        );
        assert!(rule.validate(&cs_type, &mv_type).is_ok());
    }

    #[test]
    fn test_scoping_comparison_requires_value() {
        assert!(ScopingComparison::Equals.requires_value());
        assert!(!ScopingComparison::IsPresent.requires_value());
    }
}
