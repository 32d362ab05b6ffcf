//! PostgreSQL repository.
//!
//! Attribute values, schemas and rule definitions are stored as JSONB. Every
//! batched write runs inside a single transaction.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;
use xavyo_metaverse::{
    AttributeValue, AttributeValueChange, AttributeValues, ConnectedSystem,
    ConnectedSystemAttributeId, ConnectedSystemId, ConnectedSystemObject,
    ConnectedSystemObjectId, ConnectedSystemObjectStatus, CsoAttributeEntry, DeletionInitiator,
    ExecutionItem, JoinType, MetaverseAttributeId, MetaverseObject, MetaverseObjectChange,
    MetaverseObjectId, MetaverseObjectOrigin, MetaverseObjectType, MetaverseObjectTypeId,
    MvoAttributeEntry, PendingExport, PendingExportId, SyncRule,
};

use super::{RunProgress, SyncRepository};
use crate::error::{SyncError, SyncResult};

const CSO_COLUMNS: &str = "id, connected_system_id, type_id, external_id_attribute_id, \
    secondary_external_id_attribute_id, status, join_type, metaverse_object_id, date_joined, \
    attribute_values, pending_attribute_value_additions, pending_attribute_value_removals, \
    created_at, last_updated";

const MVO_COLUMNS: &str = "id, type_id, origin, attribute_values, \
    pending_attribute_value_additions, pending_attribute_value_removals, \
    last_connector_disconnected_date, deletion_initiated_by, created_at, updated_at";

/// Repository backed by a PostgreSQL pool.
pub struct PgSyncRepository {
    pool: PgPool,
}

impl PgSyncRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_cso(row: &PgRow) -> SyncResult<ConnectedSystemObject> {
        let status: String = row.try_get("status")?;
        let join_type: String = row.try_get("join_type")?;
        let values: Json<AttributeValues<ConnectedSystemAttributeId>> =
            row.try_get("attribute_values")?;
        let additions: Json<Vec<CsoAttributeEntry>> =
            row.try_get("pending_attribute_value_additions")?;
        let removals: Json<Vec<CsoAttributeEntry>> =
            row.try_get("pending_attribute_value_removals")?;

        Ok(ConnectedSystemObject {
            id: row.try_get::<Uuid, _>("id")?.into(),
            connected_system_id: row.try_get::<Uuid, _>("connected_system_id")?.into(),
            type_id: row.try_get::<Uuid, _>("type_id")?.into(),
            external_id_attribute_id: row.try_get::<Uuid, _>("external_id_attribute_id")?.into(),
            secondary_external_id_attribute_id: row
                .try_get::<Option<Uuid>, _>("secondary_external_id_attribute_id")?
                .map(Into::into),
            status: ConnectedSystemObjectStatus::from_str(&status).map_err(SyncError::repository)?,
            join_type: JoinType::from_str(&join_type).map_err(SyncError::repository)?,
            metaverse_object_id: row
                .try_get::<Option<Uuid>, _>("metaverse_object_id")?
                .map(Into::into),
            date_joined: row.try_get("date_joined")?,
            attribute_values: values.0,
            pending_attribute_value_additions: additions.0,
            pending_attribute_value_removals: removals.0,
            created_at: row.try_get("created_at")?,
            last_updated: row.try_get("last_updated")?,
        })
    }

    fn row_to_mvo(row: &PgRow) -> SyncResult<MetaverseObject> {
        let origin: String = row.try_get("origin")?;
        let values: Json<AttributeValues<MetaverseAttributeId>> =
            row.try_get("attribute_values")?;
        let additions: Json<Vec<MvoAttributeEntry>> =
            row.try_get("pending_attribute_value_additions")?;
        let removals: Json<Vec<MvoAttributeEntry>> =
            row.try_get("pending_attribute_value_removals")?;
        let initiator: Option<Json<DeletionInitiator>> = row.try_get("deletion_initiated_by")?;

        Ok(MetaverseObject {
            id: row.try_get::<Uuid, _>("id")?.into(),
            type_id: row.try_get::<Uuid, _>("type_id")?.into(),
            origin: MetaverseObjectOrigin::from_str(&origin).map_err(SyncError::repository)?,
            attribute_values: values.0,
            pending_attribute_value_additions: additions.0,
            pending_attribute_value_removals: removals.0,
            last_connector_disconnected_date: row.try_get("last_connector_disconnected_date")?,
            deletion_initiated_by: initiator.map(|j| j.0),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_pending_export(row: &PgRow) -> SyncResult<PendingExport> {
        let change_type: String = row.try_get("change_type")?;
        let status: String = row.try_get("status")?;
        let changes: Json<Vec<AttributeValueChange>> = row.try_get("attribute_value_changes")?;
        let error_count: i32 = row.try_get("error_count")?;

        Ok(PendingExport {
            id: row.try_get::<Uuid, _>("id")?.into(),
            connected_system_id: row.try_get::<Uuid, _>("connected_system_id")?.into(),
            connected_system_object_id: row.try_get::<Uuid, _>("connected_system_object_id")?.into(),
            change_type: change_type.parse().map_err(SyncError::repository)?,
            status: status.parse().map_err(SyncError::repository)?,
            attribute_value_changes: changes.0,
            error_count: u32::try_from(error_count).unwrap_or(0),
            source_metaverse_object_id: row
                .try_get::<Option<Uuid>, _>("source_metaverse_object_id")?
                .map(Into::into),
            created_at: row.try_get("created_at")?,
        })
    }

    async fn upsert_metaverse_objects(&self, objects: &[MetaverseObject]) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        for mvo in objects {
            sqlx::query(
                r"
                INSERT INTO metaverse_objects (
                    id, type_id, origin, attribute_values, pending_attribute_value_additions,
                    pending_attribute_value_removals, last_connector_disconnected_date,
                    deletion_initiated_by, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id) DO UPDATE SET
                    attribute_values = EXCLUDED.attribute_values,
                    pending_attribute_value_additions = EXCLUDED.pending_attribute_value_additions,
                    pending_attribute_value_removals = EXCLUDED.pending_attribute_value_removals,
                    last_connector_disconnected_date = EXCLUDED.last_connector_disconnected_date,
                    deletion_initiated_by = EXCLUDED.deletion_initiated_by,
                    updated_at = EXCLUDED.updated_at
                ",
            )
            .bind(mvo.id.as_uuid())
            .bind(mvo.type_id.as_uuid())
            .bind(mvo.origin.as_str())
            .bind(Json(&mvo.attribute_values))
            .bind(Json(&mvo.pending_attribute_value_additions))
            .bind(Json(&mvo.pending_attribute_value_removals))
            .bind(mvo.last_connector_disconnected_date)
            .bind(mvo.deletion_initiated_by.as_ref().map(Json))
            .bind(mvo.created_at)
            .bind(mvo.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_connected_system_objects(
        &self,
        objects: &[ConnectedSystemObject],
    ) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        for cso in objects {
            sqlx::query(
                r"
                INSERT INTO connected_system_objects (
                    id, connected_system_id, type_id, external_id_attribute_id,
                    secondary_external_id_attribute_id, status, join_type, metaverse_object_id,
                    date_joined, attribute_values, pending_attribute_value_additions,
                    pending_attribute_value_removals, created_at, last_updated
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (id) DO UPDATE SET
                    status = EXCLUDED.status,
                    join_type = EXCLUDED.join_type,
                    metaverse_object_id = EXCLUDED.metaverse_object_id,
                    date_joined = EXCLUDED.date_joined,
                    attribute_values = EXCLUDED.attribute_values,
                    pending_attribute_value_additions = EXCLUDED.pending_attribute_value_additions,
                    pending_attribute_value_removals = EXCLUDED.pending_attribute_value_removals
                ",
            )
            .bind(cso.id.as_uuid())
            .bind(cso.connected_system_id.as_uuid())
            .bind(cso.type_id.as_uuid())
            .bind(cso.external_id_attribute_id.as_uuid())
            .bind(cso.secondary_external_id_attribute_id.map(|a| a.as_uuid()))
            .bind(cso.status.as_str())
            .bind(cso.join_type.as_str())
            .bind(cso.metaverse_object_id.map(|m| m.as_uuid()))
            .bind(cso.date_joined)
            .bind(Json(&cso.attribute_values))
            .bind(Json(&cso.pending_attribute_value_additions))
            .bind(Json(&cso.pending_attribute_value_removals))
            .bind(cso.created_at)
            .bind(cso.last_updated)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_pending_exports(&self, exports: &[PendingExport]) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        for export in exports {
            sqlx::query(
                r"
                INSERT INTO pending_exports (
                    id, connected_system_id, connected_system_object_id, change_type, status,
                    attribute_value_changes, error_count, source_metaverse_object_id, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO UPDATE SET
                    change_type = EXCLUDED.change_type,
                    status = EXCLUDED.status,
                    attribute_value_changes = EXCLUDED.attribute_value_changes,
                    error_count = EXCLUDED.error_count
                ",
            )
            .bind(export.id.as_uuid())
            .bind(export.connected_system_id.as_uuid())
            .bind(export.connected_system_object_id.as_uuid())
            .bind(export.change_type.as_str())
            .bind(export.status.as_str())
            .bind(Json(&export.attribute_value_changes))
            .bind(i32::try_from(export.error_count).unwrap_or(i32::MAX))
            .bind(export.source_metaverse_object_id.map(|m| m.as_uuid()))
            .bind(export.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn to_uuids<T: Copy + Into<Uuid>>(ids: &[T]) -> Vec<Uuid> {
    ids.iter().map(|id| (*id).into()).collect()
}

fn definitions<T: serde::de::DeserializeOwned>(rows: &[PgRow]) -> SyncResult<Vec<T>> {
    rows.iter()
        .map(|row| -> SyncResult<T> {
            let definition: Json<T> = row.try_get("definition")?;
            Ok(definition.0)
        })
        .collect()
}

#[async_trait]
impl SyncRepository for PgSyncRepository {
    #[instrument(skip(self))]
    async fn get_connected_system(
        &self,
        id: ConnectedSystemId,
    ) -> SyncResult<Option<ConnectedSystem>> {
        let row = sqlx::query(
            r"
            SELECT definition, last_delta_sync_completed_at
            FROM connected_systems
            WHERE id = $1
            ",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> SyncResult<ConnectedSystem> {
            let mut system: Json<ConnectedSystem> = r.try_get("definition")?;
            system.0.last_delta_sync_completed_at = r.try_get("last_delta_sync_completed_at")?;
            Ok(system.0)
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn get_connected_systems(&self) -> SyncResult<Vec<ConnectedSystem>> {
        let rows = sqlx::query(
            r"
            SELECT definition, last_delta_sync_completed_at
            FROM connected_systems
            ORDER BY id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> SyncResult<ConnectedSystem> {
                let mut system: Json<ConnectedSystem> = r.try_get("definition")?;
                system.0.last_delta_sync_completed_at =
                    r.try_get("last_delta_sync_completed_at")?;
                Ok(system.0)
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn get_metaverse_object_types(&self) -> SyncResult<Vec<MetaverseObjectType>> {
        let rows = sqlx::query("SELECT definition FROM metaverse_object_types ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        definitions(&rows)
    }

    #[instrument(skip(self))]
    async fn get_sync_rules(&self) -> SyncResult<Vec<SyncRule>> {
        let rows = sqlx::query("SELECT definition FROM sync_rules ORDER BY position, id")
            .fetch_all(&self.pool)
            .await?;
        definitions(&rows)
    }

    #[instrument(skip(self))]
    async fn count_connected_system_objects(
        &self,
        system_id: ConnectedSystemId,
        modified_since: Option<DateTime<Utc>>,
    ) -> SyncResult<usize> {
        let row = sqlx::query(
            r"
            SELECT COUNT(*) AS object_count
            FROM connected_system_objects
            WHERE connected_system_id = $1
              AND ($2::timestamptz IS NULL OR last_updated > $2)
            ",
        )
        .bind(system_id.as_uuid())
        .bind(modified_since)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("object_count")?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    #[instrument(skip(self))]
    async fn get_connected_system_objects_page(
        &self,
        system_id: ConnectedSystemId,
        modified_since: Option<DateTime<Utc>>,
        after: Option<ConnectedSystemObjectId>,
        limit: usize,
    ) -> SyncResult<Vec<ConnectedSystemObject>> {
        let sql = format!(
            r"
            SELECT {CSO_COLUMNS}
            FROM connected_system_objects
            WHERE connected_system_id = $1
              AND ($2::timestamptz IS NULL OR last_updated > $2)
              AND ($3::uuid IS NULL OR id > $3)
            ORDER BY id
            LIMIT $4
            "
        );
        let rows = sqlx::query(&sql)
            .bind(system_id.as_uuid())
            .bind(modified_since)
            .bind(after.map(|a| a.as_uuid()))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_cso).collect()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn get_connected_system_objects(
        &self,
        ids: &[ConnectedSystemObjectId],
    ) -> SyncResult<Vec<ConnectedSystemObject>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {CSO_COLUMNS} FROM connected_system_objects WHERE id = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(to_uuids(ids))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_cso).collect()
    }

    #[instrument(skip(self, mvo_ids), fields(count = mvo_ids.len()))]
    async fn get_joined_connected_system_objects(
        &self,
        mvo_ids: &[MetaverseObjectId],
    ) -> SyncResult<Vec<ConnectedSystemObject>> {
        if mvo_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {CSO_COLUMNS} FROM connected_system_objects \
             WHERE metaverse_object_id = ANY($1) ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(to_uuids(mvo_ids))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_cso).collect()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn get_metaverse_objects(
        &self,
        ids: &[MetaverseObjectId],
    ) -> SyncResult<Vec<MetaverseObject>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {MVO_COLUMNS} FROM metaverse_objects WHERE id = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(to_uuids(ids))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_mvo).collect()
    }

    #[instrument(skip(self, value))]
    async fn find_metaverse_objects_by_attribute(
        &self,
        type_id: MetaverseObjectTypeId,
        attribute_id: MetaverseAttributeId,
        value: &AttributeValue,
    ) -> SyncResult<Vec<MetaverseObjectId>> {
        let needle = serde_json::json!([{ "attribute_id": attribute_id, "value": value }]);
        let rows = sqlx::query(
            r"
            SELECT id
            FROM metaverse_objects
            WHERE type_id = $1 AND attribute_values @> $2
            ORDER BY id
            ",
        )
        .bind(type_id.as_uuid())
        .bind(Json(needle))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> SyncResult<MetaverseObjectId> { Ok(r.try_get::<Uuid, _>("id")?.into()) })
            .collect()
    }

    #[instrument(skip(self, cso_ids), fields(count = cso_ids.len()))]
    async fn get_pending_exports(
        &self,
        cso_ids: &[ConnectedSystemObjectId],
    ) -> SyncResult<Vec<PendingExport>> {
        if cso_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r"
            SELECT id, connected_system_id, connected_system_object_id, change_type, status,
                   attribute_value_changes, error_count, source_metaverse_object_id, created_at
            FROM pending_exports
            WHERE connected_system_object_id = ANY($1)
            ORDER BY created_at
            ",
        )
        .bind(to_uuids(cso_ids))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_pending_export).collect()
    }

    #[instrument(skip(self, objects), fields(count = objects.len()))]
    async fn create_metaverse_objects(&self, objects: &[MetaverseObject]) -> SyncResult<()> {
        self.upsert_metaverse_objects(objects).await
    }

    #[instrument(skip(self, objects), fields(count = objects.len()))]
    async fn update_metaverse_objects(&self, objects: &[MetaverseObject]) -> SyncResult<()> {
        self.upsert_metaverse_objects(objects).await
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn delete_metaverse_objects(&self, ids: &[MetaverseObjectId]) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r"
            UPDATE connected_system_objects
            SET metaverse_object_id = NULL, join_type = 'not_joined', date_joined = NULL
            WHERE metaverse_object_id = ANY($1)
            ",
        )
        .bind(to_uuids(ids))
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM metaverse_objects WHERE id = ANY($1)")
            .bind(to_uuids(ids))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, changes), fields(count = changes.len()))]
    async fn create_metaverse_object_changes(
        &self,
        changes: &[MetaverseObjectChange],
    ) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        for change in changes {
            sqlx::query(
                r"
                INSERT INTO metaverse_object_changes (
                    id, metaverse_object_id, kind, attribute_changes, initiated_by,
                    activity_id, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(change.id)
            .bind(change.metaverse_object_id.as_uuid())
            .bind(change.kind.as_str())
            .bind(Json(&change.attribute_changes))
            .bind(change.initiated_by.map(|c| c.as_uuid()))
            .bind(change.activity_id.map(|a| a.as_uuid()))
            .bind(change.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, objects), fields(count = objects.len()))]
    async fn create_connected_system_objects(
        &self,
        objects: &[ConnectedSystemObject],
    ) -> SyncResult<()> {
        self.upsert_connected_system_objects(objects).await
    }

    #[instrument(skip(self, objects), fields(count = objects.len()))]
    async fn update_connected_system_objects(
        &self,
        objects: &[ConnectedSystemObject],
    ) -> SyncResult<()> {
        self.upsert_connected_system_objects(objects).await
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn delete_connected_system_objects(
        &self,
        ids: &[ConnectedSystemObjectId],
    ) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pending_exports WHERE connected_system_object_id = ANY($1)")
            .bind(to_uuids(ids))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM connected_system_objects WHERE id = ANY($1)")
            .bind(to_uuids(ids))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, exports), fields(count = exports.len()))]
    async fn create_pending_exports(&self, exports: &[PendingExport]) -> SyncResult<()> {
        self.upsert_pending_exports(exports).await
    }

    #[instrument(skip(self, exports), fields(count = exports.len()))]
    async fn update_pending_exports(&self, exports: &[PendingExport]) -> SyncResult<()> {
        self.upsert_pending_exports(exports).await
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn delete_pending_exports(&self, ids: &[PendingExportId]) -> SyncResult<()> {
        sqlx::query("DELETE FROM pending_exports WHERE id = ANY($1)")
            .bind(to_uuids(ids))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, items), fields(count = items.len()))]
    async fn create_execution_items(&self, items: &[ExecutionItem]) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                r"
                INSERT INTO run_profile_execution_items (
                    id, activity_id, connected_system_object_id, metaverse_object_id,
                    object_change_type, error_type, error_message, attribute_flow_count,
                    created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ",
            )
            .bind(item.id.as_uuid())
            .bind(item.activity_id.as_uuid())
            .bind(item.connected_system_object_id.map(|c| c.as_uuid()))
            .bind(item.metaverse_object_id.map(|m| m.as_uuid()))
            .bind(item.object_change_type.as_str())
            .bind(item.error_type.map(|e| e.as_str()))
            .bind(&item.error_message)
            .bind(i32::try_from(item.attribute_flow_count).unwrap_or(i32::MAX))
            .bind(item.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, items), fields(count = items.len()))]
    async fn update_execution_items(&self, items: &[ExecutionItem]) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                r"
                UPDATE run_profile_execution_items
                SET metaverse_object_id = $2, attribute_flow_count = $3
                WHERE id = $1
                ",
            )
            .bind(item.id.as_uuid())
            .bind(item.metaverse_object_id.map(|m| m.as_uuid()))
            .bind(i32::try_from(item.attribute_flow_count).unwrap_or(i32::MAX))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, progress), fields(activity_id = %progress.activity_id))]
    async fn update_run_progress(&self, progress: &RunProgress) -> SyncResult<()> {
        sqlx::query(
            r"
            INSERT INTO sync_run_progress (
                activity_id, connected_system_id, total_objects, objects_processed,
                pages_processed, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (activity_id) DO UPDATE SET
                total_objects = EXCLUDED.total_objects,
                objects_processed = EXCLUDED.objects_processed,
                pages_processed = EXCLUDED.pages_processed,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(progress.activity_id.as_uuid())
        .bind(progress.connected_system_id.as_uuid())
        .bind(i64::try_from(progress.total_objects).unwrap_or(i64::MAX))
        .bind(i64::try_from(progress.objects_processed).unwrap_or(i64::MAX))
        .bind(i64::try_from(progress.pages_processed).unwrap_or(i64::MAX))
        .bind(progress.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_delta_sync_watermark(
        &self,
        system_id: ConnectedSystemId,
        completed_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let result = sqlx::query(
            r"
            UPDATE connected_systems
            SET last_delta_sync_completed_at = $2
            WHERE id = $1
            ",
        )
        .bind(system_id.as_uuid())
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::not_found("connected system", system_id));
        }
        Ok(())
    }
}
