//! # Metaverse Object Model
//!
//! Domain types shared by the xavyo identity synchronization engine.
//!
//! - **Connected System Objects** (CSOs): staged mirrors of objects in an
//!   external system, with pending import deltas
//! - **Metaverse Objects** (MVOs): the reconciled identity records CSOs join to
//! - **Sync Rules**: import/export mappings, scoping and matching
//! - **Pending Exports**: staged outbound changes
//! - **Audit Records**: per-object execution items and MVO change records
//!
//! The crate performs no I/O. Objects reference each other by typed id only.

pub mod activity;
pub mod error;
pub mod export;
pub mod ids;
pub mod objects;
pub mod rules;
pub mod schema;
pub mod value;

pub use activity::{
    ExecutionErrorType, ExecutionItem, MetaverseAttributeChange, MetaverseChangeKind,
    MetaverseObjectChange, ObjectChangeType,
};
pub use error::{MetaverseError, MetaverseResult};
pub use export::{
    AttributeChangeType, AttributeValueChange, PendingExport, PendingExportChangeType,
    PendingExportStatus,
};
pub use ids::{
    ActivityId, ConnectedSystemAttributeId, ConnectedSystemId, ConnectedSystemObjectId,
    ConnectedSystemObjectTypeId, ExecutionItemId, MetaverseAttributeId, MetaverseObjectId,
    MetaverseObjectTypeId, ParseIdError, PendingExportId, SyncRuleId,
};
pub use objects::{
    AppliedChanges, ConnectedSystemObject, ConnectedSystemObjectStatus, CsoAttributeEntry,
    DeletionInitiator, JoinType, MetaverseObject, MetaverseObjectOrigin, MvoAttributeEntry,
};
pub use rules::{
    AttributeFlowRule, InboundOutOfScopeAction, ObjectMatchingRule, ScopingComparison,
    ScopingCriteriaGroup, ScopingCriterion, ScopingGroupType, SyncRule, SyncRuleDirection,
};
pub use schema::{
    AttributeDataType, AttributePlurality, ConnectedSystem, ConnectedSystemAttribute,
    ConnectedSystemObjectType, DeletionRule, MetaverseAttribute, MetaverseObjectType,
    SchemaAttribute,
};
pub use value::{AttributeEntry, AttributeValue, AttributeValues, Reference};
