//! Run summary aggregated from execution items.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xavyo_metaverse::{
    ActivityId, ConnectedSystemId, ExecutionErrorType, ExecutionItem, ObjectChangeType,
};

use crate::orchestrator::{SyncMode, SyncRunPhase};

/// Outcome of one synchronization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub activity_id: ActivityId,
    pub connected_system_id: ConnectedSystemId,
    pub mode: SyncMode,
    /// Phase the run ended in.
    pub status: SyncRunPhase,
    /// Objects selected for the run.
    #[serde(default)]
    pub objects_total: usize,
    /// Objects that went through both passes.
    #[serde(default)]
    pub objects_processed: usize,
    #[serde(default)]
    pub pages_processed: usize,
    /// Successful outcomes broken down by change type.
    #[serde(default)]
    pub changes_by_type: HashMap<String, u32>,
    /// Per-object failures broken down by error type.
    #[serde(default)]
    pub errors_by_type: HashMap<String, u32>,
    #[serde(default)]
    pub pending_exports_created: usize,
    /// Export targets whose values already matched.
    #[serde(default)]
    pub no_net_change_count: usize,
    /// Cause of a failed run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncRunSummary {
    #[must_use]
    pub fn new(
        activity_id: ActivityId,
        connected_system_id: ConnectedSystemId,
        mode: SyncMode,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            activity_id,
            connected_system_id,
            mode,
            status: SyncRunPhase::Preparing,
            objects_total: 0,
            objects_processed: 0,
            pages_processed: 0,
            changes_by_type: HashMap::new(),
            errors_by_type: HashMap::new(),
            pending_exports_created: 0,
            no_net_change_count: 0,
            error_message: None,
            started_at,
            completed_at: None,
        }
    }

    /// Count one execution item.
    pub fn record(&mut self, item: &ExecutionItem) {
        match item.error_type {
            Some(error_type) => {
                *self.errors_by_type.entry(error_type.to_string()).or_insert(0) += 1;
            }
            None => {
                *self
                    .changes_by_type
                    .entry(item.object_change_type.to_string())
                    .or_insert(0) += 1;
            }
        }
    }

    pub fn record_all<'a>(&mut self, items: impl IntoIterator<Item = &'a ExecutionItem>) {
        for item in items {
            self.record(item);
        }
    }

    #[must_use]
    pub fn change_count(&self, change_type: ObjectChangeType) -> u32 {
        self.changes_by_type
            .get(change_type.as_str())
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn error_count(&self, error_type: ExecutionErrorType) -> u32 {
        self.errors_by_type
            .get(error_type.as_str())
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn total_errors(&self) -> u32 {
        self.errors_by_type.values().sum()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == SyncRunPhase::Completed
    }

    /// Duration in seconds, once completed.
    #[must_use]
    pub fn duration_seconds(&self) -> Option<i64> {
        self.completed_at
            .map(|completed| (completed - self.started_at).num_seconds())
    }

    /// Merge counts from another summary.
    pub fn merge(&mut self, other: &SyncRunSummary) {
        self.objects_processed += other.objects_processed;
        self.pages_processed += other.pages_processed;
        self.pending_exports_created += other.pending_exports_created;
        self.no_net_change_count += other.no_net_change_count;

        for (key, value) in &other.changes_by_type {
            *self.changes_by_type.entry(key.clone()).or_insert(0) += value;
        }

        for (key, value) in &other.errors_by_type {
            *self.errors_by_type.entry(key.clone()).or_insert(0) += value;
        }
    }
}
