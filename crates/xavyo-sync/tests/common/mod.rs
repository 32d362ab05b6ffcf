//! Common fixtures for sync engine integration tests.
//!
//! Two connected systems share one `person` metaverse type: an HR system
//! that projects identities and a directory that joins to them and
//! receives exports. Everything runs against the in-memory repository.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;
use xavyo_metaverse::{
    AttributeDataType, AttributeFlowRule, AttributeValue, ConnectedSystem,
    ConnectedSystemAttributeId, ConnectedSystemId, ConnectedSystemObject,
    ConnectedSystemObjectId, ConnectedSystemObjectType, ConnectedSystemObjectTypeId, DeletionRule,
    MetaverseAttributeId, MetaverseObject, MetaverseObjectType, MetaverseObjectTypeId,
    ObjectMatchingRule, SchemaAttribute, SyncRule,
};
use xavyo_sync::{
    CancellationFlag, InMemorySyncRepository, MatchResult, MetaverseObjectMatcher,
    SyncEngineConfig, SyncRequest, SyncResult, SyncRunSummary, SyncRunner,
};

/// Schemas, rules and storage shared by a test.
pub struct World {
    pub repository: Arc<InMemorySyncRepository>,
    pub hr: ConnectedSystemId,
    pub directory: ConnectedSystemId,
    pub person: MetaverseObjectType,

    pub hr_user: ConnectedSystemObjectTypeId,
    pub hr_employee_id: ConnectedSystemAttributeId,
    pub hr_name: ConnectedSystemAttributeId,
    pub hr_department: ConnectedSystemAttributeId,
    pub hr_manager: ConnectedSystemAttributeId,
    pub hr_groups: ConnectedSystemAttributeId,
    pub hr_status: ConnectedSystemAttributeId,

    pub dir_user: ConnectedSystemObjectTypeId,
    pub dir_account: ConnectedSystemAttributeId,
    pub dir_name: ConnectedSystemAttributeId,
    pub dir_groups: ConnectedSystemAttributeId,
    pub dir_title: ConnectedSystemAttributeId,

    pub mv_employee_id: MetaverseAttributeId,
    pub mv_name: MetaverseAttributeId,
    pub mv_department: MetaverseAttributeId,
    pub mv_manager: MetaverseAttributeId,
    pub mv_groups: MetaverseAttributeId,
    pub mv_title: MetaverseAttributeId,

    /// Set before `install` to make the directory drop contributed values on obsoletion.
    pub remove_contributed_on_obsoletion: bool,
}

impl World {
    pub fn new() -> Self {
        let mv_employee_id = MetaverseAttributeId::new();
        let mv_name = MetaverseAttributeId::new();
        let mv_department = MetaverseAttributeId::new();
        let mv_manager = MetaverseAttributeId::new();
        let mv_groups = MetaverseAttributeId::new();
        let mv_title = MetaverseAttributeId::new();

        let person = MetaverseObjectType {
            id: MetaverseObjectTypeId::new(),
            name: "person".to_string(),
            attributes: vec![
                SchemaAttribute::single(mv_employee_id, "EmployeeId", AttributeDataType::Text),
                SchemaAttribute::single(mv_name, "DisplayName", AttributeDataType::Text),
                SchemaAttribute::single(mv_department, "Department", AttributeDataType::Text),
                SchemaAttribute::single(mv_manager, "Manager", AttributeDataType::Reference),
                SchemaAttribute::multi(mv_groups, "Groups", AttributeDataType::Text),
                SchemaAttribute::single(mv_title, "Title", AttributeDataType::Text),
            ],
            deletion_rule: DeletionRule::Manual,
            deletion_grace_period: None,
            deletion_trigger_connected_system_ids: Vec::new(),
        };

        Self {
            repository: Arc::new(InMemorySyncRepository::new()),
            hr: ConnectedSystemId::new(),
            directory: ConnectedSystemId::new(),
            person,
            hr_user: ConnectedSystemObjectTypeId::new(),
            hr_employee_id: ConnectedSystemAttributeId::new(),
            hr_name: ConnectedSystemAttributeId::new(),
            hr_department: ConnectedSystemAttributeId::new(),
            hr_manager: ConnectedSystemAttributeId::new(),
            hr_groups: ConnectedSystemAttributeId::new(),
            hr_status: ConnectedSystemAttributeId::new(),
            dir_user: ConnectedSystemObjectTypeId::new(),
            dir_account: ConnectedSystemAttributeId::new(),
            dir_name: ConnectedSystemAttributeId::new(),
            dir_groups: ConnectedSystemAttributeId::new(),
            dir_title: ConnectedSystemAttributeId::new(),
            mv_employee_id,
            mv_name,
            mv_department,
            mv_manager,
            mv_groups,
            mv_title,
            remove_contributed_on_obsoletion: false,
        }
    }

    fn hr_system(&self) -> ConnectedSystem {
        ConnectedSystem {
            id: self.hr,
            name: "hr".to_string(),
            object_types: vec![ConnectedSystemObjectType {
                id: self.hr_user,
                name: "worker".to_string(),
                attributes: vec![
                    SchemaAttribute::single(self.hr_employee_id, "employeeId", AttributeDataType::Text),
                    SchemaAttribute::single(self.hr_name, "fullName", AttributeDataType::Text),
                    SchemaAttribute::single(self.hr_department, "department", AttributeDataType::Text),
                    SchemaAttribute::single(self.hr_manager, "manager", AttributeDataType::Reference),
                    SchemaAttribute::multi(self.hr_groups, "groups", AttributeDataType::Text),
                    SchemaAttribute::single(self.hr_status, "status", AttributeDataType::Text),
                ],
                external_id_attribute_id: Some(self.hr_employee_id),
                remove_contributed_attributes_on_obsoletion: false,
            }],
            last_delta_sync_completed_at: None,
        }
    }

    fn directory_system(&self) -> ConnectedSystem {
        ConnectedSystem {
            id: self.directory,
            name: "directory".to_string(),
            object_types: vec![ConnectedSystemObjectType {
                id: self.dir_user,
                name: "user".to_string(),
                attributes: vec![
                    SchemaAttribute::single(self.dir_account, "sAMAccountName", AttributeDataType::Text),
                    SchemaAttribute::single(self.dir_name, "displayName", AttributeDataType::Text),
                    SchemaAttribute::multi(self.dir_groups, "memberOf", AttributeDataType::Text),
                    SchemaAttribute::single(self.dir_title, "title", AttributeDataType::Text),
                ],
                external_id_attribute_id: Some(self.dir_account),
                remove_contributed_attributes_on_obsoletion: self.remove_contributed_on_obsoletion,
            }],
            last_delta_sync_completed_at: None,
        }
    }

    /// Register both systems, the metaverse type and the given rules.
    pub async fn install(&self, rules: Vec<SyncRule>) {
        self.repository.add_connected_system(self.hr_system()).await;
        self.repository
            .add_connected_system(self.directory_system())
            .await;
        self.repository
            .add_metaverse_object_type(self.person.clone())
            .await;
        for rule in rules {
            self.repository.add_sync_rule(rule).await;
        }
    }

    /// HR import: projects, joins on employee id, flows identity attributes.
    pub fn hr_import(&self) -> SyncRule {
        SyncRule::import("hr inbound", self.hr, self.hr_user, self.person.id)
            .projecting()
            .with_matching(ObjectMatchingRule {
                connected_system_attribute_id: self.hr_employee_id,
                metaverse_attribute_id: self.mv_employee_id,
            })
            .with_flow(AttributeFlowRule::direct(self.hr_employee_id, self.mv_employee_id))
            .with_flow(AttributeFlowRule::direct(self.hr_name, self.mv_name))
            .with_flow(AttributeFlowRule::direct(self.hr_department, self.mv_department))
            .with_flow(AttributeFlowRule::direct(self.hr_manager, self.mv_manager))
            .with_flow(AttributeFlowRule::direct(self.hr_groups, self.mv_groups))
    }

    /// Directory import: joins on account name, contributes the title.
    pub fn directory_import(&self) -> SyncRule {
        SyncRule::import("directory inbound", self.directory, self.dir_user, self.person.id)
            .with_matching(ObjectMatchingRule {
                connected_system_attribute_id: self.dir_account,
                metaverse_attribute_id: self.mv_employee_id,
            })
            .with_flow(AttributeFlowRule::direct(self.dir_title, self.mv_title))
    }

    /// Directory export of name and groups.
    pub fn directory_export(&self) -> SyncRule {
        SyncRule::export("directory outbound", self.directory, self.dir_user, self.person.id)
            .with_flow(AttributeFlowRule::direct(self.dir_name, self.mv_name))
            .with_flow(AttributeFlowRule::direct(self.dir_groups, self.mv_groups))
    }

    /// An HR worker with a fixed id, so page order is predictable.
    pub fn hr_object(&self, n: u128, employee_id: &str, name: &str) -> ConnectedSystemObject {
        let mut cso = ConnectedSystemObject::new(self.hr, self.hr_user, self.hr_employee_id)
            .with_value(self.hr_employee_id, employee_id)
            .with_value(self.hr_name, name);
        cso.id = object_id(n);
        cso
    }

    pub fn directory_object(&self, n: u128, account: &str) -> ConnectedSystemObject {
        let mut cso = ConnectedSystemObject::new(self.directory, self.dir_user, self.dir_account)
            .with_value(self.dir_account, account);
        cso.id = object_id(n);
        cso
    }

    pub async fn store(&self, objects: Vec<ConnectedSystemObject>) {
        for cso in objects {
            self.repository.insert_connected_system_object(cso).await;
        }
    }

    pub fn runner(&self) -> SyncRunner {
        SyncRunner::new(self.repository.clone())
    }

    pub fn runner_with(&self, config: SyncEngineConfig) -> SyncRunner {
        SyncRunner::new(self.repository.clone()).with_config(config)
    }

    pub async fn full_sync(&self, system: ConnectedSystemId) -> SyncRunSummary {
        self.runner().run(SyncRequest::full(system)).await
    }

    pub async fn object(&self, id: ConnectedSystemObjectId) -> ConnectedSystemObject {
        self.repository
            .connected_system_object(id)
            .await
            .unwrap_or_else(|| panic!("connected system object {id} not stored"))
    }

    /// The metaverse object a stored connected system object is joined to.
    pub async fn joined_mvo(&self, id: ConnectedSystemObjectId) -> Option<MetaverseObject> {
        let mvo_id = self.object(id).await.metaverse_object_id?;
        self.repository.metaverse_object(mvo_id).await
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

pub fn object_id(n: u128) -> ConnectedSystemObjectId {
    ConnectedSystemObjectId::from_uuid(Uuid::from_u128(n))
}

/// Text values of an attribute, in stored order.
pub fn texts(mvo: &MetaverseObject, attribute: MetaverseAttributeId) -> Vec<String> {
    mvo.attribute_values
        .values_of(attribute)
        .filter_map(|v| v.as_text().map(str::to_string))
        .collect()
}

/// Seed a metaverse object as if an earlier run had projected it.
pub async fn seed_mvo(world: &World, values: Vec<(MetaverseAttributeId, AttributeValue)>) -> MetaverseObject {
    let mut mvo = MetaverseObject::project(world.person.id, Utc::now());
    for (attribute, value) in values {
        mvo = mvo.with_value(attribute, value);
    }
    world.repository.insert_metaverse_object(mvo.clone()).await;
    mvo
}

/// Matcher that always reports the same result.
pub struct FixedMatcher(pub MatchResult);

#[async_trait]
impl MetaverseObjectMatcher for FixedMatcher {
    async fn find_matching_metaverse_object(
        &self,
        _cso: &ConnectedSystemObject,
        _rule: &SyncRule,
    ) -> SyncResult<MatchResult> {
        Ok(self.0.clone())
    }
}

/// Matcher that cancels the run the first time it is asked for a match,
/// so the object being matched is the last one processed.
pub struct CancellingMatcher(pub CancellationFlag);

#[async_trait]
impl MetaverseObjectMatcher for CancellingMatcher {
    async fn find_matching_metaverse_object(
        &self,
        _cso: &ConnectedSystemObject,
        _rule: &SyncRule,
    ) -> SyncResult<MatchResult> {
        self.0.cancel();
        Ok(MatchResult::NoMatch)
    }
}
