//! In-memory repository used by tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use xavyo_metaverse::{
    AttributeValue, ConnectedSystem, ConnectedSystemId, ConnectedSystemObject,
    ConnectedSystemObjectId, ExecutionItem, JoinType, MetaverseAttributeId, MetaverseObject,
    MetaverseObjectChange, MetaverseObjectId, MetaverseObjectType, MetaverseObjectTypeId,
    PendingExport, PendingExportId, SyncRule,
};

use super::{RunProgress, SyncRepository};
use crate::error::{SyncError, SyncResult};

#[derive(Default)]
struct State {
    connected_systems: HashMap<ConnectedSystemId, ConnectedSystem>,
    metaverse_object_types: Vec<MetaverseObjectType>,
    sync_rules: Vec<SyncRule>,
    connected_system_objects: BTreeMap<ConnectedSystemObjectId, ConnectedSystemObject>,
    metaverse_objects: HashMap<MetaverseObjectId, MetaverseObject>,
    pending_exports: BTreeMap<PendingExportId, PendingExport>,
    metaverse_object_changes: Vec<MetaverseObjectChange>,
    execution_items: Vec<ExecutionItem>,
    run_progress: Vec<RunProgress>,
    write_calls: usize,
}

/// Repository holding everything in process memory.
#[derive(Default)]
pub struct InMemorySyncRepository {
    state: RwLock<State>,
}

impl InMemorySyncRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_connected_system(&self, system: ConnectedSystem) {
        self.state
            .write()
            .await
            .connected_systems
            .insert(system.id, system);
    }

    pub async fn add_metaverse_object_type(&self, object_type: MetaverseObjectType) {
        self.state.write().await.metaverse_object_types.push(object_type);
    }

    pub async fn add_sync_rule(&self, rule: SyncRule) {
        self.state.write().await.sync_rules.push(rule);
    }

    pub async fn insert_connected_system_object(&self, cso: ConnectedSystemObject) {
        self.state
            .write()
            .await
            .connected_system_objects
            .insert(cso.id, cso);
    }

    pub async fn insert_metaverse_object(&self, mvo: MetaverseObject) {
        self.state.write().await.metaverse_objects.insert(mvo.id, mvo);
    }

    pub async fn insert_pending_export(&self, export: PendingExport) {
        self.state
            .write()
            .await
            .pending_exports
            .insert(export.id, export);
    }

    pub async fn connected_system(&self, id: ConnectedSystemId) -> Option<ConnectedSystem> {
        self.state.read().await.connected_systems.get(&id).cloned()
    }

    pub async fn connected_system_object(
        &self,
        id: ConnectedSystemObjectId,
    ) -> Option<ConnectedSystemObject> {
        self.state
            .read()
            .await
            .connected_system_objects
            .get(&id)
            .cloned()
    }

    pub async fn connected_system_objects(&self) -> Vec<ConnectedSystemObject> {
        self.state
            .read()
            .await
            .connected_system_objects
            .values()
            .cloned()
            .collect()
    }

    pub async fn metaverse_object(&self, id: MetaverseObjectId) -> Option<MetaverseObject> {
        self.state.read().await.metaverse_objects.get(&id).cloned()
    }

    pub async fn metaverse_objects(&self) -> Vec<MetaverseObject> {
        self.state
            .read()
            .await
            .metaverse_objects
            .values()
            .cloned()
            .collect()
    }

    pub async fn pending_exports(&self) -> Vec<PendingExport> {
        self.state
            .read()
            .await
            .pending_exports
            .values()
            .cloned()
            .collect()
    }

    pub async fn metaverse_object_changes(&self) -> Vec<MetaverseObjectChange> {
        self.state.read().await.metaverse_object_changes.clone()
    }

    pub async fn execution_items(&self) -> Vec<ExecutionItem> {
        self.state.read().await.execution_items.clone()
    }

    pub async fn run_progress(&self) -> Vec<RunProgress> {
        self.state.read().await.run_progress.clone()
    }

    /// Number of batched write calls received so far.
    pub async fn write_calls(&self) -> usize {
        self.state.read().await.write_calls
    }
}

fn is_modified_since(cso: &ConnectedSystemObject, since: Option<DateTime<Utc>>) -> bool {
    since.map_or(true, |watermark| cso.last_updated > watermark)
}

#[async_trait]
impl SyncRepository for InMemorySyncRepository {
    async fn get_connected_system(
        &self,
        id: ConnectedSystemId,
    ) -> SyncResult<Option<ConnectedSystem>> {
        Ok(self.state.read().await.connected_systems.get(&id).cloned())
    }

    async fn get_connected_systems(&self) -> SyncResult<Vec<ConnectedSystem>> {
        Ok(self
            .state
            .read()
            .await
            .connected_systems
            .values()
            .cloned()
            .collect())
    }

    async fn get_metaverse_object_types(&self) -> SyncResult<Vec<MetaverseObjectType>> {
        Ok(self.state.read().await.metaverse_object_types.clone())
    }

    async fn get_sync_rules(&self) -> SyncResult<Vec<SyncRule>> {
        Ok(self.state.read().await.sync_rules.clone())
    }

    async fn count_connected_system_objects(
        &self,
        system_id: ConnectedSystemId,
        modified_since: Option<DateTime<Utc>>,
    ) -> SyncResult<usize> {
        Ok(self
            .state
            .read()
            .await
            .connected_system_objects
            .values()
            .filter(|c| c.connected_system_id == system_id && is_modified_since(c, modified_since))
            .count())
    }

    async fn get_connected_system_objects_page(
        &self,
        system_id: ConnectedSystemId,
        modified_since: Option<DateTime<Utc>>,
        after: Option<ConnectedSystemObjectId>,
        limit: usize,
    ) -> SyncResult<Vec<ConnectedSystemObject>> {
        let state = self.state.read().await;
        let page = state
            .connected_system_objects
            .values()
            .filter(|c| after.map_or(true, |cursor| c.id > cursor))
            .filter(|c| c.connected_system_id == system_id && is_modified_since(c, modified_since))
            .take(limit)
            .cloned()
            .collect();
        Ok(page)
    }

    async fn get_connected_system_objects(
        &self,
        ids: &[ConnectedSystemObjectId],
    ) -> SyncResult<Vec<ConnectedSystemObject>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.connected_system_objects.get(id).cloned())
            .collect())
    }

    async fn get_joined_connected_system_objects(
        &self,
        mvo_ids: &[MetaverseObjectId],
    ) -> SyncResult<Vec<ConnectedSystemObject>> {
        let wanted: HashSet<MetaverseObjectId> = mvo_ids.iter().copied().collect();
        Ok(self
            .state
            .read()
            .await
            .connected_system_objects
            .values()
            .filter(|c| c.metaverse_object_id.is_some_and(|id| wanted.contains(&id)))
            .cloned()
            .collect())
    }

    async fn get_metaverse_objects(
        &self,
        ids: &[MetaverseObjectId],
    ) -> SyncResult<Vec<MetaverseObject>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.metaverse_objects.get(id).cloned())
            .collect())
    }

    async fn find_metaverse_objects_by_attribute(
        &self,
        type_id: MetaverseObjectTypeId,
        attribute_id: MetaverseAttributeId,
        value: &AttributeValue,
    ) -> SyncResult<Vec<MetaverseObjectId>> {
        let state = self.state.read().await;
        let mut ids: Vec<MetaverseObjectId> = state
            .metaverse_objects
            .values()
            .filter(|m| m.type_id == type_id && m.attribute_values.contains(attribute_id, value))
            .map(|m| m.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_pending_exports(
        &self,
        cso_ids: &[ConnectedSystemObjectId],
    ) -> SyncResult<Vec<PendingExport>> {
        let wanted: HashSet<ConnectedSystemObjectId> = cso_ids.iter().copied().collect();
        Ok(self
            .state
            .read()
            .await
            .pending_exports
            .values()
            .filter(|e| wanted.contains(&e.connected_system_object_id))
            .cloned()
            .collect())
    }

    async fn create_metaverse_objects(&self, objects: &[MetaverseObject]) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.write_calls += 1;
        for mvo in objects {
            if state.metaverse_objects.contains_key(&mvo.id) {
                return Err(SyncError::repository(format!(
                    "metaverse object {} already exists",
                    mvo.id
                )));
            }
            state.metaverse_objects.insert(mvo.id, mvo.clone());
        }
        Ok(())
    }

    async fn update_metaverse_objects(&self, objects: &[MetaverseObject]) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.write_calls += 1;
        for mvo in objects {
            state.metaverse_objects.insert(mvo.id, mvo.clone());
        }
        Ok(())
    }

    async fn delete_metaverse_objects(&self, ids: &[MetaverseObjectId]) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.write_calls += 1;
        for id in ids {
            state.metaverse_objects.remove(id);
        }
        for cso in state.connected_system_objects.values_mut() {
            if cso.metaverse_object_id.is_some_and(|m| ids.contains(&m)) {
                cso.metaverse_object_id = None;
                cso.join_type = JoinType::NotJoined;
                cso.date_joined = None;
            }
        }
        Ok(())
    }

    async fn create_metaverse_object_changes(
        &self,
        changes: &[MetaverseObjectChange],
    ) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.write_calls += 1;
        state.metaverse_object_changes.extend_from_slice(changes);
        Ok(())
    }

    async fn create_connected_system_objects(
        &self,
        objects: &[ConnectedSystemObject],
    ) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.write_calls += 1;
        for cso in objects {
            state.connected_system_objects.insert(cso.id, cso.clone());
        }
        Ok(())
    }

    async fn update_connected_system_objects(
        &self,
        objects: &[ConnectedSystemObject],
    ) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.write_calls += 1;
        for cso in objects {
            if let Some(mvo_id) = cso.metaverse_object_id {
                if !state.metaverse_objects.contains_key(&mvo_id) {
                    return Err(SyncError::repository(format!(
                        "connected system object {} joined to missing metaverse object {mvo_id}",
                        cso.id
                    )));
                }
            }
            state.connected_system_objects.insert(cso.id, cso.clone());
        }
        Ok(())
    }

    async fn delete_connected_system_objects(
        &self,
        ids: &[ConnectedSystemObjectId],
    ) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.write_calls += 1;
        for id in ids {
            state.connected_system_objects.remove(id);
        }
        state
            .pending_exports
            .retain(|_, e| !ids.contains(&e.connected_system_object_id));
        Ok(())
    }

    async fn create_pending_exports(&self, exports: &[PendingExport]) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.write_calls += 1;
        for export in exports {
            state.pending_exports.insert(export.id, export.clone());
        }
        Ok(())
    }

    async fn update_pending_exports(&self, exports: &[PendingExport]) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.write_calls += 1;
        for export in exports {
            state.pending_exports.insert(export.id, export.clone());
        }
        Ok(())
    }

    async fn delete_pending_exports(&self, ids: &[PendingExportId]) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.write_calls += 1;
        for id in ids {
            state.pending_exports.remove(id);
        }
        Ok(())
    }

    async fn create_execution_items(&self, items: &[ExecutionItem]) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.write_calls += 1;
        state.execution_items.extend_from_slice(items);
        Ok(())
    }

    async fn update_execution_items(&self, items: &[ExecutionItem]) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.write_calls += 1;
        for item in items {
            if let Some(stored) = state.execution_items.iter_mut().find(|i| i.id == item.id) {
                stored.metaverse_object_id = item.metaverse_object_id;
                stored.attribute_flow_count = item.attribute_flow_count;
            }
        }
        Ok(())
    }

    async fn update_run_progress(&self, progress: &RunProgress) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state
            .run_progress
            .retain(|p| p.activity_id != progress.activity_id);
        state.run_progress.push(progress.clone());
        Ok(())
    }

    async fn update_delta_sync_watermark(
        &self,
        system_id: ConnectedSystemId,
        completed_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let mut state = self.state.write().await;
        let system = state
            .connected_systems
            .get_mut(&system_id)
            .ok_or_else(|| SyncError::not_found("connected system", system_id))?;
        system.last_delta_sync_completed_at = Some(completed_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xavyo_metaverse::{ConnectedSystemAttributeId, ConnectedSystemObjectTypeId};

    fn cso(system: ConnectedSystemId) -> ConnectedSystemObject {
        ConnectedSystemObject::new(
            system,
            ConnectedSystemObjectTypeId::new(),
            ConnectedSystemAttributeId::new(),
        )
    }

    #[tokio::test]
    async fn test_keyset_pagination_is_stable_across_deletes() {
        let repo = InMemorySyncRepository::new();
        let system = ConnectedSystemId::new();
        for _ in 0..5 {
            repo.insert_connected_system_object(cso(system)).await;
        }

        let first = repo
            .get_connected_system_objects_page(system, None, None, 2)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        // Deleting objects on the page just read must not shift the cursor.
        let ids: Vec<_> = first.iter().map(|c| c.id).collect();
        repo.delete_connected_system_objects(&ids).await.unwrap();

        let second = repo
            .get_connected_system_objects_page(system, None, ids.last().copied(), 2)
            .await
            .unwrap();
        let third = repo
            .get_connected_system_objects_page(system, None, second.last().map(|c| c.id), 2)
            .await
            .unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(third.len(), 1);
    }

    #[tokio::test]
    async fn test_modified_since_filter() {
        let repo = InMemorySyncRepository::new();
        let system = ConnectedSystemId::new();
        let mut old = cso(system);
        old.last_updated = Utc::now() - chrono::Duration::hours(2);
        repo.insert_connected_system_object(old).await;
        repo.insert_connected_system_object(cso(system)).await;

        let watermark = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(
            repo.count_connected_system_objects(system, Some(watermark))
                .await
                .unwrap(),
            1
        );
        assert_eq!(repo.count_connected_system_objects(system, None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_metaverse_object_unjoins() {
        let repo = InMemorySyncRepository::new();
        let system = ConnectedSystemId::new();
        let mvo = MetaverseObject::project(MetaverseObjectTypeId::new(), Utc::now());
        let mut joined = cso(system);
        joined.join_to(mvo.id, JoinType::Projected, Utc::now());
        let cso_id = joined.id;
        repo.insert_metaverse_object(mvo.clone()).await;
        repo.insert_connected_system_object(joined).await;

        repo.delete_metaverse_objects(&[mvo.id]).await.unwrap();

        let cso = repo.connected_system_object(cso_id).await.unwrap();
        assert!(cso.metaverse_object_id.is_none());
        assert_eq!(cso.join_type, JoinType::NotJoined);
    }

    #[tokio::test]
    async fn test_update_rejects_join_to_missing_metaverse_object() {
        let repo = InMemorySyncRepository::new();
        let mut orphan = cso(ConnectedSystemId::new());
        orphan.join_to(MetaverseObjectId::new(), JoinType::Joined, Utc::now());

        let err = repo
            .update_connected_system_objects(&[orphan])
            .await
            .unwrap_err();
        assert!(err.is_systemic());
    }
}
