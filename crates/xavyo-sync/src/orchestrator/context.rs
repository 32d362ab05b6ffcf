//! Schemas and rules loaded once per run.

use std::collections::HashMap;

use tracing::debug;
use xavyo_metaverse::{
    ActivityId, ConnectedSystem, ConnectedSystemId, ConnectedSystemObject,
    ConnectedSystemObjectId, ConnectedSystemObjectType, ConnectedSystemObjectTypeId,
    DeletionInitiator, ExecutionErrorType, ExecutionItem, MetaverseObjectType,
    MetaverseObjectTypeId, ObjectChangeType, SyncRule,
};

use crate::drift::ImportContributorCache;
use crate::error::{SyncError, SyncResult};
use crate::repository::SyncRepository;

use super::SyncRequest;

pub(super) struct RunContext {
    pub activity_id: ActivityId,
    pub system: ConnectedSystem,
    pub connected_systems: HashMap<ConnectedSystemId, ConnectedSystem>,
    pub object_types: HashMap<MetaverseObjectTypeId, MetaverseObjectType>,
    /// Enabled import rules of the system being synchronized, in order.
    pub import_rules: Vec<SyncRule>,
    /// Enabled export rules of every system.
    pub export_rules: Vec<SyncRule>,
    pub contributors: ImportContributorCache,
    pub dry_run: bool,
}

impl RunContext {
    /// Load and validate everything the run depends on.
    ///
    /// A missing schema or an inconsistent rule aborts the run here, before
    /// any object is touched.
    pub async fn prepare(
        repository: &dyn SyncRepository,
        request: &SyncRequest,
        dry_run: bool,
    ) -> SyncResult<Self> {
        let system = repository
            .get_connected_system(request.connected_system_id)
            .await?
            .ok_or_else(|| {
                SyncError::missing_schema("connected system", request.connected_system_id)
            })?;

        let connected_systems: HashMap<_, _> = repository
            .get_connected_systems()
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
        let object_types: HashMap<_, _> = repository
            .get_metaverse_object_types()
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        let rules: Vec<SyncRule> = repository
            .get_sync_rules()
            .await?
            .into_iter()
            .filter(|r| r.enabled)
            .collect();
        let contributors = ImportContributorCache::build(&rules);

        let (import_rules, export_rules): (Vec<SyncRule>, Vec<SyncRule>) =
            rules.into_iter().partition(SyncRule::is_import);
        let import_rules: Vec<SyncRule> = import_rules
            .into_iter()
            .filter(|r| r.connected_system_id == system.id)
            .collect();

        for rule in import_rules.iter().chain(export_rules.iter()) {
            let cs_type = connected_systems
                .get(&rule.connected_system_id)
                .ok_or_else(|| {
                    SyncError::missing_schema("connected system", rule.connected_system_id)
                })?
                .object_type(rule.connected_system_object_type_id)
                .ok_or_else(|| {
                    SyncError::missing_schema(
                        "connected system object type",
                        rule.connected_system_object_type_id,
                    )
                })?;
            let mv_type = object_types.get(&rule.metaverse_object_type_id).ok_or_else(|| {
                SyncError::missing_schema("metaverse object type", rule.metaverse_object_type_id)
            })?;
            rule.validate(cs_type, mv_type)?;
        }

        debug!(
            import_rules = import_rules.len(),
            export_rules = export_rules.len(),
            contributors = contributors.len(),
            "Loaded sync rules"
        );

        Ok(Self {
            activity_id: request.activity_id,
            system,
            connected_systems,
            object_types,
            import_rules,
            export_rules,
            contributors,
            dry_run,
        })
    }

    pub fn cs_type(&self, type_id: ConnectedSystemObjectTypeId) -> SyncResult<&ConnectedSystemObjectType> {
        self.system
            .object_type(type_id)
            .ok_or_else(|| SyncError::missing_schema("connected system object type", type_id))
    }

    pub fn mv_type(&self, type_id: MetaverseObjectTypeId) -> SyncResult<&MetaverseObjectType> {
        self.object_types
            .get(&type_id)
            .ok_or_else(|| SyncError::missing_schema("metaverse object type", type_id))
    }

    pub fn item(&self, cso_id: ConnectedSystemObjectId, change: ObjectChangeType) -> ExecutionItem {
        ExecutionItem::new(self.activity_id, Some(cso_id), change)
    }

    pub fn error_item(
        &self,
        cso_id: ConnectedSystemObjectId,
        error_type: ExecutionErrorType,
        message: impl Into<String>,
    ) -> ExecutionItem {
        ExecutionItem::new(self.activity_id, Some(cso_id), ObjectChangeType::NoChange)
            .with_error(error_type, message)
    }

    pub fn initiator(&self, cso: &ConnectedSystemObject) -> DeletionInitiator {
        DeletionInitiator {
            connected_system_id: cso.connected_system_id,
            connected_system_object_id: cso.id,
            activity_id: Some(self.activity_id),
        }
    }
}
