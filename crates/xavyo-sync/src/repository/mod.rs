//! Persistence seam for the sync engine.
//!
//! The engine never writes object-by-object: every write method takes a
//! whole collection so a page flush is a fixed, small number of calls.

mod memory;
mod postgres;

pub use memory::InMemorySyncRepository;
pub use postgres::PgSyncRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xavyo_metaverse::{
    ActivityId, AttributeValue, ConnectedSystem, ConnectedSystemId, ConnectedSystemObject,
    ConnectedSystemObjectId, ExecutionItem, MetaverseAttributeId, MetaverseObject,
    MetaverseObjectChange, MetaverseObjectId, MetaverseObjectType, MetaverseObjectTypeId,
    PendingExport, PendingExportId, SyncRule,
};

use crate::error::SyncResult;

/// Progress of a run, persisted periodically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub activity_id: ActivityId,
    pub connected_system_id: ConnectedSystemId,
    pub total_objects: usize,
    pub objects_processed: usize,
    pub pages_processed: usize,
    pub updated_at: DateTime<Utc>,
}

impl RunProgress {
    /// Calculate progress percentage.
    #[must_use]
    pub fn progress_percentage(&self) -> f64 {
        if self.total_objects == 0 {
            0.0
        } else {
            (self.objects_processed as f64 / self.total_objects as f64) * 100.0
        }
    }
}

/// Storage operations the engine depends on.
#[async_trait]
pub trait SyncRepository: Send + Sync {
    async fn get_connected_system(
        &self,
        id: ConnectedSystemId,
    ) -> SyncResult<Option<ConnectedSystem>>;

    async fn get_connected_systems(&self) -> SyncResult<Vec<ConnectedSystem>>;

    async fn get_metaverse_object_types(&self) -> SyncResult<Vec<MetaverseObjectType>>;

    /// All sync rules of every connected system.
    async fn get_sync_rules(&self) -> SyncResult<Vec<SyncRule>>;

    /// Count objects of a system, optionally only those updated after a watermark.
    async fn count_connected_system_objects(
        &self,
        system_id: ConnectedSystemId,
        modified_since: Option<DateTime<Utc>>,
    ) -> SyncResult<usize>;

    /// One page of objects ordered by id, strictly after `after`.
    async fn get_connected_system_objects_page(
        &self,
        system_id: ConnectedSystemId,
        modified_since: Option<DateTime<Utc>>,
        after: Option<ConnectedSystemObjectId>,
        limit: usize,
    ) -> SyncResult<Vec<ConnectedSystemObject>>;

    async fn get_connected_system_objects(
        &self,
        ids: &[ConnectedSystemObjectId],
    ) -> SyncResult<Vec<ConnectedSystemObject>>;

    /// Objects in any system joined to one of the given metaverse objects.
    async fn get_joined_connected_system_objects(
        &self,
        mvo_ids: &[MetaverseObjectId],
    ) -> SyncResult<Vec<ConnectedSystemObject>>;

    async fn get_metaverse_objects(
        &self,
        ids: &[MetaverseObjectId],
    ) -> SyncResult<Vec<MetaverseObject>>;

    /// Ids of metaverse objects of a type holding the given attribute value.
    async fn find_metaverse_objects_by_attribute(
        &self,
        type_id: MetaverseObjectTypeId,
        attribute_id: MetaverseAttributeId,
        value: &AttributeValue,
    ) -> SyncResult<Vec<MetaverseObjectId>>;

    async fn get_pending_exports(
        &self,
        cso_ids: &[ConnectedSystemObjectId],
    ) -> SyncResult<Vec<PendingExport>>;

    async fn create_metaverse_objects(&self, objects: &[MetaverseObject]) -> SyncResult<()>;

    async fn update_metaverse_objects(&self, objects: &[MetaverseObject]) -> SyncResult<()>;

    /// Delete metaverse objects. Objects still joined to them are unjoined.
    async fn delete_metaverse_objects(&self, ids: &[MetaverseObjectId]) -> SyncResult<()>;

    async fn create_metaverse_object_changes(
        &self,
        changes: &[MetaverseObjectChange],
    ) -> SyncResult<()>;

    async fn create_connected_system_objects(
        &self,
        objects: &[ConnectedSystemObject],
    ) -> SyncResult<()>;

    /// Persist objects as given; `last_updated` is not touched.
    async fn update_connected_system_objects(
        &self,
        objects: &[ConnectedSystemObject],
    ) -> SyncResult<()>;

    /// Delete objects together with their pending exports.
    async fn delete_connected_system_objects(
        &self,
        ids: &[ConnectedSystemObjectId],
    ) -> SyncResult<()>;

    async fn create_pending_exports(&self, exports: &[PendingExport]) -> SyncResult<()>;

    async fn update_pending_exports(&self, exports: &[PendingExport]) -> SyncResult<()>;

    async fn delete_pending_exports(&self, ids: &[PendingExportId]) -> SyncResult<()>;

    async fn create_execution_items(&self, items: &[ExecutionItem]) -> SyncResult<()>;

    /// Rewrite the flow count and metaverse object of existing items.
    async fn update_execution_items(&self, items: &[ExecutionItem]) -> SyncResult<()>;

    async fn update_run_progress(&self, progress: &RunProgress) -> SyncResult<()>;

    async fn update_delta_sync_watermark(
        &self,
        system_id: ConnectedSystemId,
        completed_at: DateTime<Utc>,
    ) -> SyncResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percentage() {
        let mut progress = RunProgress {
            activity_id: ActivityId::new(),
            connected_system_id: ConnectedSystemId::new(),
            total_objects: 0,
            objects_processed: 0,
            pages_processed: 0,
            updated_at: Utc::now(),
        };
        assert!((progress.progress_percentage() - 0.0).abs() < f64::EPSILON);

        progress.total_objects = 200;
        progress.objects_processed = 50;
        assert!((progress.progress_percentage() - 25.0).abs() < f64::EPSILON);
    }
}
