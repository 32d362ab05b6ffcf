//! Per-page working set.
//!
//! A [`PageBatch`] owns every object loaded for one page (an id-keyed arena
//! of connected system objects and metaverse objects) together with all
//! writes deferred until the page is flushed. Objects refer to each other
//! by id only.

use std::collections::{BTreeMap, HashMap, HashSet};

use xavyo_metaverse::{
    ConnectedSystemId, ConnectedSystemObject, ConnectedSystemObjectId, DeletionInitiator,
    ExecutionItem, ExecutionItemId, MetaverseObject, MetaverseObjectId, ObjectChangeType,
    PendingExport, PendingExportId, SyncRuleId,
};

/// An object whose reference attributes could not be resolved within its
/// page, with the rules to re-run once every page is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossPageReference {
    pub connected_system_object_id: ConnectedSystemObjectId,
    pub sync_rule_ids: Vec<SyncRuleId>,
    /// Join, projection or flow item the object already got on its page.
    pub execution_item: Option<ExecutionItem>,
}

/// A metaverse object queued for deletion at the flush boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedDeletion {
    pub metaverse_object_id: MetaverseObjectId,
    pub initiator: DeletionInitiator,
}

/// Deferred writes and lookups for one page.
#[derive(Debug, Default)]
pub struct PageBatch {
    pub(crate) page_number: usize,
    pub(crate) connected_system_objects: BTreeMap<ConnectedSystemObjectId, ConnectedSystemObject>,
    pub(crate) metaverse_objects: HashMap<MetaverseObjectId, MetaverseObject>,
    pub(crate) pending_exports: HashMap<ConnectedSystemObjectId, Vec<PendingExport>>,

    mvo_creates: Vec<MetaverseObjectId>,
    mvo_updates: Vec<MetaverseObjectId>,
    mvo_initiators: HashMap<MetaverseObjectId, ConnectedSystemObjectId>,
    mvo_deletes: Vec<QueuedDeletion>,

    cso_updates: Vec<ConnectedSystemObjectId>,
    cso_deletes: Vec<ConnectedSystemObjectId>,
    pub(crate) provisioning_csos: Vec<ConnectedSystemObject>,

    pub(crate) pending_export_creates: Vec<PendingExport>,
    pub(crate) pending_export_updates: Vec<PendingExport>,
    pub(crate) pending_export_deletes: Vec<PendingExportId>,

    execution_items: Vec<ExecutionItem>,
    item_index: HashMap<ConnectedSystemObjectId, usize>,
    adopted_items: HashSet<ExecutionItemId>,

    deferred_references: Vec<(ConnectedSystemObjectId, Vec<SyncRuleId>)>,
    cross_page: Vec<CrossPageReference>,
    reconciled: Vec<ConnectedSystemObjectId>,
}

impl PageBatch {
    #[must_use]
    pub fn new(page_number: usize) -> Self {
        Self {
            page_number,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn page_number(&self) -> usize {
        self.page_number
    }

    /// Load the page's connected system objects into the arena.
    pub fn load_objects(&mut self, objects: Vec<ConnectedSystemObject>) {
        for cso in objects {
            self.connected_system_objects.insert(cso.id, cso);
        }
    }

    /// Page object ids in cursor order.
    #[must_use]
    pub fn object_ids(&self) -> Vec<ConnectedSystemObjectId> {
        self.connected_system_objects.keys().copied().collect()
    }

    #[must_use]
    pub fn connected_system_object(&self, id: ConnectedSystemObjectId) -> Option<&ConnectedSystemObject> {
        self.connected_system_objects.get(&id)
    }

    pub fn connected_system_object_mut(
        &mut self,
        id: ConnectedSystemObjectId,
    ) -> Option<&mut ConnectedSystemObject> {
        self.connected_system_objects.get_mut(&id)
    }

    /// Add a metaverse object to the arena unless it is already there.
    pub fn insert_metaverse_object(&mut self, mvo: MetaverseObject) {
        self.metaverse_objects.entry(mvo.id).or_insert(mvo);
    }

    #[must_use]
    pub fn contains_metaverse_object(&self, id: MetaverseObjectId) -> bool {
        self.metaverse_objects.contains_key(&id)
    }

    #[must_use]
    pub fn metaverse_object(&self, id: MetaverseObjectId) -> Option<&MetaverseObject> {
        self.metaverse_objects.get(&id)
    }

    pub fn metaverse_object_mut(&mut self, id: MetaverseObjectId) -> Option<&mut MetaverseObject> {
        self.metaverse_objects.get_mut(&id)
    }

    /// Queue a projected object for creation.
    pub fn queue_metaverse_object_create(&mut self, mvo: MetaverseObject, initiator: ConnectedSystemObjectId) {
        let id = mvo.id;
        self.metaverse_objects.insert(id, mvo);
        push_unique(&mut self.mvo_creates, id);
        self.mvo_initiators.insert(id, initiator);
    }

    /// Mark an existing object as needing an update.
    pub fn mark_metaverse_object_updated(
        &mut self,
        id: MetaverseObjectId,
        initiator: Option<ConnectedSystemObjectId>,
    ) {
        if !self.mvo_creates.contains(&id) {
            push_unique(&mut self.mvo_updates, id);
        }
        if let Some(cso_id) = initiator {
            self.mvo_initiators.insert(id, cso_id);
        }
    }

    #[must_use]
    pub fn is_created_in_batch(&self, id: MetaverseObjectId) -> bool {
        self.mvo_creates.contains(&id)
    }

    #[must_use]
    pub fn metaverse_object_creates(&self) -> &[MetaverseObjectId] {
        &self.mvo_creates
    }

    #[must_use]
    pub fn metaverse_object_updates(&self) -> &[MetaverseObjectId] {
        &self.mvo_updates
    }

    #[must_use]
    pub fn initiator_of(&self, id: MetaverseObjectId) -> Option<ConnectedSystemObjectId> {
        self.mvo_initiators.get(&id).copied()
    }

    pub fn queue_metaverse_object_delete(&mut self, id: MetaverseObjectId, initiator: DeletionInitiator) {
        if !self.is_queued_for_deletion(id) {
            self.mvo_deletes.push(QueuedDeletion {
                metaverse_object_id: id,
                initiator,
            });
        }
    }

    /// Withdraw a queued deletion. Returns whether one was queued.
    pub fn cancel_metaverse_object_delete(&mut self, id: MetaverseObjectId) -> bool {
        let before = self.mvo_deletes.len();
        self.mvo_deletes.retain(|d| d.metaverse_object_id != id);
        before != self.mvo_deletes.len()
    }

    #[must_use]
    pub fn is_queued_for_deletion(&self, id: MetaverseObjectId) -> bool {
        self.mvo_deletes.iter().any(|d| d.metaverse_object_id == id)
    }

    #[must_use]
    pub fn metaverse_object_deletes(&self) -> &[QueuedDeletion] {
        &self.mvo_deletes
    }

    pub fn mark_connected_system_object_updated(&mut self, id: ConnectedSystemObjectId) {
        push_unique(&mut self.cso_updates, id);
    }

    #[must_use]
    pub fn connected_system_object_updates(&self) -> Vec<ConnectedSystemObject> {
        self.cso_updates
            .iter()
            .filter(|id| !self.cso_deletes.contains(id))
            .filter_map(|id| self.connected_system_objects.get(id).cloned())
            .collect()
    }

    pub fn queue_connected_system_object_delete(&mut self, id: ConnectedSystemObjectId) {
        push_unique(&mut self.cso_deletes, id);
    }

    #[must_use]
    pub fn connected_system_object_deletes(&self) -> &[ConnectedSystemObjectId] {
        &self.cso_deletes
    }

    #[must_use]
    pub fn is_queued_for_removal(&self, id: ConnectedSystemObjectId) -> bool {
        self.cso_deletes.contains(&id)
    }

    /// A not-yet-executed export already staged for an object, if any.
    pub fn pending_export_for_mut(&mut self, cso_id: ConnectedSystemObjectId) -> Option<&mut PendingExport> {
        if let Some(index) = self
            .pending_export_creates
            .iter()
            .position(|e| e.connected_system_object_id == cso_id && e.is_pending())
        {
            return self.pending_export_creates.get_mut(index);
        }
        if let Some(index) = self
            .pending_export_updates
            .iter()
            .position(|e| e.connected_system_object_id == cso_id && e.is_pending())
        {
            return self.pending_export_updates.get_mut(index);
        }
        None
    }

    /// Stage a new export, or fold its changes into one already staged.
    pub fn stage_pending_export(&mut self, export: PendingExport) {
        if let Some(existing) = self.pending_export_for_mut(export.connected_system_object_id) {
            if existing.change_type == export.change_type {
                existing.merge_changes(export.attribute_value_changes);
                return;
            }
        }
        self.pending_export_creates.push(export);
    }

    /// Stage an update of a stored export, replacing an earlier staged copy.
    pub fn stage_pending_export_update(&mut self, export: PendingExport) {
        if let Some(existing) = self
            .pending_export_updates
            .iter_mut()
            .find(|e| e.id == export.id)
        {
            *existing = export;
            return;
        }
        self.pending_export_updates.push(export);
    }

    pub fn stage_pending_export_delete(&mut self, id: PendingExportId) {
        self.pending_export_updates.retain(|e| e.id != id);
        push_unique(&mut self.pending_export_deletes, id);
    }

    /// Record an execution item. The first join, projection or flow item
    /// per object receives attribute flow counts.
    pub fn record(&mut self, item: ExecutionItem) {
        let carries_flow = matches!(
            item.object_change_type,
            ObjectChangeType::Joined | ObjectChangeType::Projected | ObjectChangeType::AttributeFlow
        );
        if let (Some(cso_id), true) = (item.connected_system_object_id, carries_flow) {
            self.item_index.entry(cso_id).or_insert(self.execution_items.len());
        }
        self.execution_items.push(item);
    }

    /// Take over an item persisted by an earlier batch. Later flow counts
    /// update it instead of recording a new item.
    pub fn adopt_execution_item(&mut self, item: ExecutionItem) {
        self.adopted_items.insert(item.id);
        self.record(item);
    }

    pub fn item_for_mut(&mut self, cso_id: ConnectedSystemObjectId) -> Option<&mut ExecutionItem> {
        let index = *self.item_index.get(&cso_id)?;
        self.execution_items.get_mut(index)
    }

    #[must_use]
    pub fn item_for(&self, cso_id: ConnectedSystemObjectId) -> Option<&ExecutionItem> {
        let index = *self.item_index.get(&cso_id)?;
        self.execution_items.get(index)
    }

    #[must_use]
    pub fn execution_items(&self) -> &[ExecutionItem] {
        &self.execution_items
    }

    /// Items recorded by this batch, excluding adopted ones.
    #[must_use]
    pub fn new_execution_items(&self) -> Vec<ExecutionItem> {
        self.execution_items
            .iter()
            .filter(|i| !self.adopted_items.contains(&i.id))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn adopted_execution_items(&self) -> Vec<ExecutionItem> {
        self.execution_items
            .iter()
            .filter(|i| self.adopted_items.contains(&i.id))
            .cloned()
            .collect()
    }

    /// Remember an object for the page's reference flow pass.
    pub fn defer_reference_flow(&mut self, cso_id: ConnectedSystemObjectId, rules: Vec<SyncRuleId>) {
        self.deferred_references.push((cso_id, rules));
    }

    pub fn take_deferred_references(&mut self) -> Vec<(ConnectedSystemObjectId, Vec<SyncRuleId>)> {
        std::mem::take(&mut self.deferred_references)
    }

    pub fn record_cross_page_reference(&mut self, reference: CrossPageReference) {
        self.cross_page.push(reference);
    }

    pub fn take_cross_page_references(&mut self) -> Vec<CrossPageReference> {
        std::mem::take(&mut self.cross_page)
    }

    /// Remember an object that went through join and flow, for drift checks.
    pub fn mark_reconciled(&mut self, id: ConnectedSystemObjectId) {
        push_unique(&mut self.reconciled, id);
    }

    #[must_use]
    pub fn reconciled(&self) -> &[ConnectedSystemObjectId] {
        &self.reconciled
    }

    /// Overlay this page's unflushed join state onto objects read from storage.
    ///
    /// Stored objects also present in the page are replaced by the page's
    /// copy, and page objects joined to one of `mvo_ids` are added.
    #[must_use]
    pub fn joined_objects(
        &self,
        stored: Vec<ConnectedSystemObject>,
        mvo_ids: &HashSet<MetaverseObjectId>,
    ) -> Vec<ConnectedSystemObject> {
        let mut seen = HashSet::new();
        let mut joined = Vec::new();

        for cso in stored {
            let current = self
                .connected_system_objects
                .get(&cso.id)
                .cloned()
                .unwrap_or(cso);
            seen.insert(current.id);
            if current.metaverse_object_id.is_some_and(|id| mvo_ids.contains(&id)) {
                joined.push(current);
            }
        }

        for cso in self
            .connected_system_objects
            .values()
            .chain(self.provisioning_csos.iter())
        {
            if !seen.contains(&cso.id)
                && cso.metaverse_object_id.is_some_and(|id| mvo_ids.contains(&id))
            {
                seen.insert(cso.id);
                joined.push(cso.clone());
            }
        }
        joined
    }

    /// Metaverse objects projected in this page and not yet flushed.
    pub fn staged_projections(&self) -> impl Iterator<Item = &MetaverseObject> + '_ {
        self.mvo_creates
            .iter()
            .filter_map(|id| self.metaverse_objects.get(id))
    }

    /// Number of objects of `system_id` joined to `mvo_id`, excluding `exclude`,
    /// given the stored joins and this page's unflushed changes.
    #[must_use]
    pub fn effective_join_count(
        &self,
        mvo_id: MetaverseObjectId,
        system_id: Option<ConnectedSystemId>,
        stored: Vec<ConnectedSystemObject>,
        exclude: ConnectedSystemObjectId,
    ) -> usize {
        let wanted = HashSet::from([mvo_id]);
        self.joined_objects(stored, &wanted)
            .iter()
            .filter(|c| c.id != exclude)
            .filter(|c| system_id.map_or(true, |s| c.connected_system_id == s))
            .count()
    }
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, value: T) {
    if !list.contains(&value) {
        list.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use xavyo_metaverse::{
        ActivityId, ConnectedSystemAttributeId, ConnectedSystemObjectTypeId, JoinType,
        MetaverseObjectTypeId, PendingExportChangeType,
    };

    fn cso(system: ConnectedSystemId) -> ConnectedSystemObject {
        ConnectedSystemObject::new(
            system,
            ConnectedSystemObjectTypeId::new(),
            ConnectedSystemAttributeId::new(),
        )
    }

    #[test]
    fn test_disconnect_in_page_frees_join_slot() {
        let system = ConnectedSystemId::new();
        let mvo = MetaverseObject::project(MetaverseObjectTypeId::new(), Utc::now());

        let mut old = cso(system);
        old.join_to(mvo.id, JoinType::Joined, Utc::now());
        let stored = vec![old.clone()];

        let mut batch = PageBatch::new(1);
        let newcomer = cso(system);
        batch.load_objects(vec![old.clone(), newcomer.clone()]);

        assert_eq!(
            batch.effective_join_count(mvo.id, Some(system), stored.clone(), newcomer.id),
            1
        );

        batch
            .connected_system_object_mut(old.id)
            .unwrap()
            .disconnect();
        assert_eq!(
            batch.effective_join_count(mvo.id, Some(system), stored, newcomer.id),
            0
        );
    }

    #[test]
    fn test_join_in_page_counts_before_flush() {
        let system = ConnectedSystemId::new();
        let mvo_id = MetaverseObjectId::new();
        let mut first = cso(system);
        let second = cso(system);
        first.join_to(mvo_id, JoinType::Joined, Utc::now());

        let mut batch = PageBatch::new(1);
        batch.load_objects(vec![first, second.clone()]);

        assert_eq!(
            batch.effective_join_count(mvo_id, Some(system), Vec::new(), second.id),
            1
        );
        assert_eq!(
            batch.effective_join_count(mvo_id, Some(ConnectedSystemId::new()), Vec::new(), second.id),
            0
        );
    }

    #[test]
    fn test_create_is_not_also_an_update() {
        let mut batch = PageBatch::new(1);
        let mvo = MetaverseObject::project(MetaverseObjectTypeId::new(), Utc::now());
        let id = mvo.id;
        batch.queue_metaverse_object_create(mvo, ConnectedSystemObjectId::new());
        batch.mark_metaverse_object_updated(id, None);

        assert_eq!(batch.metaverse_object_creates(), &[id]);
        assert!(batch.metaverse_object_updates().is_empty());
    }

    #[test]
    fn test_cancel_queued_deletion() {
        let mut batch = PageBatch::new(1);
        let id = MetaverseObjectId::new();
        let initiator = DeletionInitiator {
            connected_system_id: ConnectedSystemId::new(),
            connected_system_object_id: ConnectedSystemObjectId::new(),
            activity_id: None,
        };
        batch.queue_metaverse_object_delete(id, initiator.clone());
        batch.queue_metaverse_object_delete(id, initiator);
        assert_eq!(batch.metaverse_object_deletes().len(), 1);

        assert!(batch.cancel_metaverse_object_delete(id));
        assert!(!batch.is_queued_for_deletion(id));
    }

    #[test]
    fn test_staged_exports_merge_per_object() {
        let mut batch = PageBatch::new(1);
        let system = ConnectedSystemId::new();
        let target = ConnectedSystemObjectId::new();
        let mail = ConnectedSystemAttributeId::new();
        let phone = ConnectedSystemAttributeId::new();

        batch.stage_pending_export(
            PendingExport::new(system, target, PendingExportChangeType::Update).with_changes(vec![
                xavyo_metaverse::AttributeValueChange::update(mail, "a@example.com".into()),
            ]),
        );
        batch.stage_pending_export(
            PendingExport::new(system, target, PendingExportChangeType::Update).with_changes(vec![
                xavyo_metaverse::AttributeValueChange::update(phone, "555".into()),
            ]),
        );

        assert_eq!(batch.pending_export_creates.len(), 1);
        assert_eq!(batch.pending_export_creates[0].attribute_value_changes.len(), 2);
    }

    #[test]
    fn test_first_item_receives_flow_count() {
        let mut batch = PageBatch::new(1);
        let activity = ActivityId::new();
        let cso_id = ConnectedSystemObjectId::new();
        batch.record(ExecutionItem::new(activity, Some(cso_id), ObjectChangeType::PendingExportConfirmed));
        assert!(batch.item_for_mut(cso_id).is_none());

        batch.record(ExecutionItem::new(activity, Some(cso_id), ObjectChangeType::Projected));
        batch.item_for_mut(cso_id).unwrap().attribute_flow_count += 3;

        assert_eq!(batch.execution_items()[1].attribute_flow_count, 3);
    }

    #[test]
    fn test_adopted_item_is_updated_not_recreated() {
        let mut batch = PageBatch::new(0);
        let activity = ActivityId::new();
        let cso_id = ConnectedSystemObjectId::new();
        let projected = ExecutionItem::new(activity, Some(cso_id), ObjectChangeType::Projected);
        let projected_id = projected.id;

        batch.adopt_execution_item(projected);
        batch.item_for_mut(cso_id).unwrap().attribute_flow_count += 2;
        batch.record(ExecutionItem::new(activity, Some(cso_id), ObjectChangeType::PendingExportConfirmed));

        let adopted = batch.adopted_execution_items();
        assert_eq!(adopted.len(), 1);
        assert_eq!(adopted[0].id, projected_id);
        assert_eq!(adopted[0].attribute_flow_count, 2);

        let created = batch.new_execution_items();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].object_change_type, ObjectChangeType::PendingExportConfirmed);
    }

    #[test]
    fn test_deleted_objects_are_not_updated() {
        let mut batch = PageBatch::new(1);
        let obsolete = cso(ConnectedSystemId::new());
        let id = obsolete.id;
        batch.load_objects(vec![obsolete]);
        batch.mark_connected_system_object_updated(id);
        batch.queue_connected_system_object_delete(id);

        assert!(batch.connected_system_object_updates().is_empty());
        assert_eq!(batch.connected_system_object_deletes(), &[id]);
    }
}
