//! Outbound side of a run: export evaluation, provisioning, confirmation
//! of executed exports and drift correction.

mod common;

use common::{object_id, texts, World};
use xavyo_metaverse::{
    AttributeChangeType, AttributeFlowRule, AttributeValue, ConnectedSystemObjectStatus,
    CsoAttributeEntry, JoinType, MetaverseObject, ObjectChangeType, PendingExportChangeType,
    PendingExportStatus, ScopingComparison, ScopingCriteriaGroup, ScopingCriterion, SyncRule,
};
use xavyo_sync::SyncRunPhase;

/// HR projects E1 ("Ada"), then the directory object joins to it.
async fn joined_identity(world: &World) -> MetaverseObject {
    world.store(vec![world.hr_object(1, "E1", "Ada")]).await;
    world.full_sync(world.hr).await;
    world.store(vec![world.directory_object(101, "E1")]).await;
    world.full_sync(world.directory).await;
    world.joined_mvo(object_id(101)).await.unwrap()
}

async fn rename(world: &World, name: &str) {
    let mut cso = world.object(object_id(1)).await;
    cso.attribute_values.remove_all(world.hr_name);
    cso.pending_attribute_value_additions
        .push(CsoAttributeEntry::new(world.hr_name, name));
    world.repository.insert_connected_system_object(cso).await;
}

// ============================================================================
// Export evaluation
// ============================================================================

#[tokio::test]
async fn test_import_change_stages_export_to_other_system() {
    let world = World::new();
    world
        .install(vec![
            world.hr_import(),
            world.directory_import(),
            world.directory_export(),
        ])
        .await;
    let mvo = joined_identity(&world).await;

    rename(&world, "Ada King").await;
    let summary = world.full_sync(world.hr).await;

    assert_eq!(summary.pending_exports_created, 1);
    let exports = world.repository.pending_exports().await;
    assert_eq!(exports.len(), 1);
    let export = &exports[0];
    assert_eq!(export.connected_system_id, world.directory);
    assert_eq!(export.connected_system_object_id, object_id(101));
    assert_eq!(export.change_type, PendingExportChangeType::Update);
    assert_eq!(export.status, PendingExportStatus::Pending);
    assert_eq!(export.source_metaverse_object_id, Some(mvo.id));
    assert_eq!(export.attribute_value_changes.len(), 1);
    assert_eq!(export.attribute_value_changes[0].attribute_id, world.dir_name);
    assert_eq!(
        export.attribute_value_changes[0].value,
        Some(AttributeValue::from("Ada King"))
    );
}

#[tokio::test]
async fn test_no_export_back_to_source_system() {
    let world = World::new();
    let hr_export = SyncRule::export("hr outbound", world.hr, world.hr_user, world.person.id)
        .with_flow(AttributeFlowRule::direct(world.hr_name, world.mv_name));
    world.install(vec![world.hr_import(), hr_export]).await;
    world.store(vec![world.hr_object(1, "E1", "Ada")]).await;
    world.full_sync(world.hr).await;

    rename(&world, "Ada King").await;
    let summary = world.full_sync(world.hr).await;

    assert_eq!(summary.pending_exports_created, 0);
    assert!(world.repository.pending_exports().await.is_empty());
}

#[tokio::test]
async fn test_unchanged_target_counts_as_no_net_change() {
    let world = World::new();
    world
        .install(vec![
            world.hr_import(),
            world.directory_import(),
            world.directory_export(),
        ])
        .await;
    joined_identity(&world).await;

    let mut directory = world.object(object_id(101)).await;
    directory.attribute_values.add(world.dir_name, "Ada King");
    world.repository.insert_connected_system_object(directory).await;

    rename(&world, "Ada King").await;
    let summary = world.full_sync(world.hr).await;

    assert_eq!(summary.pending_exports_created, 0);
    assert_eq!(summary.no_net_change_count, 1);
    assert!(world.repository.pending_exports().await.is_empty());
}

#[tokio::test]
async fn test_repeated_changes_merge_into_pending_export() {
    let world = World::new();
    world
        .install(vec![
            world.hr_import(),
            world.directory_import(),
            world.directory_export(),
        ])
        .await;
    joined_identity(&world).await;

    rename(&world, "Ada King").await;
    world.full_sync(world.hr).await;
    rename(&world, "Ada Lovelace").await;
    let summary = world.full_sync(world.hr).await;

    assert_eq!(summary.pending_exports_created, 0);
    let exports = world.repository.pending_exports().await;
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].attribute_value_changes.len(), 1);
    assert_eq!(
        exports[0].attribute_value_changes[0].value,
        Some(AttributeValue::from("Ada Lovelace"))
    );
}

#[tokio::test]
async fn test_provisioning_creates_object_and_create_export() {
    let world = World::new();
    let provisioning = world
        .directory_export()
        .provisioning()
        .with_flow(AttributeFlowRule::direct(world.dir_account, world.mv_employee_id));
    world.install(vec![world.hr_import(), provisioning]).await;
    world.store(vec![world.hr_object(1, "E1", "Ada")]).await;

    let summary = world.full_sync(world.hr).await;

    assert_eq!(summary.status, SyncRunPhase::Completed);
    assert_eq!(summary.pending_exports_created, 1);
    let mvo = world.joined_mvo(object_id(1)).await.unwrap();

    let provisioned: Vec<_> = world
        .repository
        .connected_system_objects()
        .await
        .into_iter()
        .filter(|c| c.connected_system_id == world.directory)
        .collect();
    assert_eq!(provisioned.len(), 1);
    assert_eq!(provisioned[0].status, ConnectedSystemObjectStatus::PendingProvisioning);
    assert_eq!(provisioned[0].join_type, JoinType::Provisioned);
    assert_eq!(provisioned[0].metaverse_object_id, Some(mvo.id));

    let exports = world.repository.pending_exports().await;
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].change_type, PendingExportChangeType::Create);
    assert_eq!(exports[0].connected_system_object_id, provisioned[0].id);
    assert!(exports[0]
        .attribute_value_changes
        .iter()
        .all(|c| c.change_type == AttributeChangeType::Add));
    assert_eq!(exports[0].attribute_value_changes.len(), 2);
}

#[tokio::test]
async fn test_change_before_provisioning_folds_into_create() {
    let world = World::new();
    let provisioning = world
        .directory_export()
        .provisioning()
        .with_flow(AttributeFlowRule::direct(world.dir_account, world.mv_employee_id));
    world.install(vec![world.hr_import(), provisioning]).await;
    world.store(vec![world.hr_object(1, "E1", "Ada")]).await;
    world.full_sync(world.hr).await;

    rename(&world, "Ada King").await;
    let summary = world.full_sync(world.hr).await;

    assert_eq!(summary.status, SyncRunPhase::Completed);
    assert_eq!(summary.pending_exports_created, 0);
    let exports = world.repository.pending_exports().await;
    assert_eq!(exports.len(), 1);
    let create = &exports[0];
    assert_eq!(create.change_type, PendingExportChangeType::Create);
    assert_eq!(create.attribute_value_changes.len(), 2);
    assert!(create
        .attribute_value_changes
        .iter()
        .all(|c| c.change_type == AttributeChangeType::Add));
    let name = create
        .attribute_value_changes
        .iter()
        .find(|c| c.attribute_id == world.dir_name)
        .unwrap();
    assert_eq!(name.value, Some(AttributeValue::from("Ada King")));
}

#[tokio::test]
async fn test_leaving_export_scope_stages_delete() {
    let world = World::new();
    let scoped = world.directory_export().with_metaverse_scope(ScopingCriteriaGroup::all(vec![
        ScopingCriterion::new(world.mv_department, ScopingComparison::Equals, "Engineering"),
    ]));
    world
        .install(vec![world.hr_import(), world.directory_import(), scoped])
        .await;
    world
        .store(vec![world.hr_object(1, "E1", "Ada").with_value(world.hr_department, "Engineering")])
        .await;
    world.full_sync(world.hr).await;
    world.store(vec![world.directory_object(101, "E1")]).await;
    world.full_sync(world.directory).await;

    let mut cso = world.object(object_id(1)).await;
    cso.attribute_values.remove_all(world.hr_department);
    cso.attribute_values.add(world.hr_department, "Sales");
    world.repository.insert_connected_system_object(cso).await;
    world.full_sync(world.hr).await;

    let exports = world.repository.pending_exports().await;
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].change_type, PendingExportChangeType::Delete);
    assert_eq!(exports[0].connected_system_object_id, object_id(101));
}

// ============================================================================
// Confirmation
// ============================================================================

#[tokio::test]
async fn test_executed_export_is_confirmed_by_import() {
    let world = World::new();
    world
        .install(vec![
            world.hr_import(),
            world.directory_import(),
            world.directory_export(),
        ])
        .await;
    joined_identity(&world).await;
    rename(&world, "Ada King").await;
    world.full_sync(world.hr).await;

    let mut export = world.repository.pending_exports().await.remove(0);
    export.status = PendingExportStatus::Exported;
    world.repository.insert_pending_export(export).await;
    let mut directory = world.object(object_id(101)).await;
    directory.attribute_values.add(world.dir_name, "Ada King");
    world.repository.insert_connected_system_object(directory).await;

    let summary = world.full_sync(world.directory).await;

    assert_eq!(summary.change_count(ObjectChangeType::PendingExportConfirmed), 1);
    assert!(world.repository.pending_exports().await.is_empty());
}

#[tokio::test]
async fn test_unconfirmed_export_is_flagged_for_retry() {
    let world = World::new();
    world
        .install(vec![
            world.hr_import(),
            world.directory_import(),
            world.directory_export(),
        ])
        .await;
    joined_identity(&world).await;
    rename(&world, "Ada King").await;
    world.full_sync(world.hr).await;

    let mut export = world.repository.pending_exports().await.remove(0);
    export.status = PendingExportStatus::Exported;
    world.repository.insert_pending_export(export).await;

    world.full_sync(world.directory).await;

    let exports = world.repository.pending_exports().await;
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].status, PendingExportStatus::ExportNotConfirmed);
    assert_eq!(exports[0].error_count, 1);
}

// ============================================================================
// Drift
// ============================================================================

#[tokio::test]
async fn test_drifted_value_is_corrected() {
    let world = World::new();
    world
        .install(vec![
            world.hr_import(),
            world.directory_import(),
            world.directory_export().enforcing(),
        ])
        .await;
    world.store(vec![world.hr_object(1, "E1", "Ada")]).await;
    world.full_sync(world.hr).await;
    world
        .store(vec![world.directory_object(101, "E1").with_value(world.dir_name, "Mallory")])
        .await;

    let summary = world.full_sync(world.directory).await;

    assert_eq!(summary.change_count(ObjectChangeType::DriftCorrection), 1);
    let exports = world.repository.pending_exports().await;
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].connected_system_object_id, object_id(101));
    assert_eq!(exports[0].change_type, PendingExportChangeType::Update);
    assert_eq!(exports[0].attribute_value_changes[0].attribute_id, world.dir_name);
    assert_eq!(
        exports[0].attribute_value_changes[0].value,
        Some(AttributeValue::from("Ada"))
    );
}

#[tokio::test]
async fn test_attribute_imported_from_same_system_is_not_drift() {
    let world = World::new();
    let directory_import = world
        .directory_import()
        .with_flow(AttributeFlowRule::direct(world.dir_name, world.mv_name));
    world
        .install(vec![
            world.hr_import(),
            directory_import,
            world.directory_export().enforcing(),
        ])
        .await;
    world.store(vec![world.hr_object(1, "E1", "Ada")]).await;
    world.full_sync(world.hr).await;
    world
        .store(vec![world.directory_object(101, "E1").with_value(world.dir_name, "Mallory")])
        .await;

    let summary = world.full_sync(world.directory).await;

    assert_eq!(summary.change_count(ObjectChangeType::DriftCorrection), 0);
    assert!(world.repository.pending_exports().await.is_empty());
    let mvo = world.joined_mvo(object_id(101)).await.unwrap();
    assert_eq!(texts(&mvo, world.mv_name), vec!["Mallory"]);
}

#[tokio::test]
async fn test_no_drift_without_enforcing_rules() {
    let world = World::new();
    world
        .install(vec![
            world.hr_import(),
            world.directory_import(),
            world.directory_export(),
        ])
        .await;
    world.store(vec![world.hr_object(1, "E1", "Ada")]).await;
    world.full_sync(world.hr).await;
    world
        .store(vec![world.directory_object(101, "E1").with_value(world.dir_name, "Mallory")])
        .await;

    let summary = world.full_sync(world.directory).await;

    assert_eq!(summary.change_count(ObjectChangeType::Joined), 1);
    assert_eq!(summary.change_count(ObjectChangeType::DriftCorrection), 0);
    assert!(world.repository.pending_exports().await.is_empty());
}
