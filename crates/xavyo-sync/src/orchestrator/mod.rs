//! Synchronization run orchestration.
//!
//! A run walks the connected system's objects page by page. Each page is
//! processed in two passes (teardown, then reconcile), followed by the
//! page's reference flow and a flush of every deferred write. References
//! that point at objects on later pages are resolved once all pages are done.

mod context;
mod cross_page;
mod flush;
mod page;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use xavyo_metaverse::{ActivityId, ConnectedSystemId};

use crate::batch::CrossPageReference;
use crate::cancellation::CancellationFlag;
use crate::config::SyncEngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::export::{ExportEvaluator, RuleBasedExportEvaluator};
use crate::expression::{ExpressionEvaluator, RhaiExpressionEvaluator};
use crate::join::{AttributeMatcher, MetaverseObjectMatcher};
use crate::repository::{RunProgress, SyncRepository};
use crate::statistics::SyncRunSummary;

use context::RunContext;

/// Which objects a run selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Every object of the connected system.
    Full,
    /// Objects updated since the last successful run.
    Delta,
}

impl SyncMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Delta => "delta",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "delta" => Ok(SyncMode::Delta),
            _ => Err(format!("Unknown sync mode: {s}")),
        }
    }
}

/// Phase of a synchronization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunPhase {
    /// Loading schemas and rules.
    Preparing,
    /// Processing the given page (1-based).
    ProcessingPage(usize),
    /// Re-running reference flow for objects deferred across pages.
    ResolvingCrossPageReferences,
    /// Advancing the delta watermark.
    WatermarkUpdate,
    Completed,
    Cancelled,
    Failed,
}

impl SyncRunPhase {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncRunPhase::Completed | SyncRunPhase::Cancelled | SyncRunPhase::Failed
        )
    }
}

impl std::fmt::Display for SyncRunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing"),
            Self::ProcessingPage(page) => write!(f, "processing_page_{page}"),
            Self::ResolvingCrossPageReferences => write!(f, "resolving_cross_page_references"),
            Self::WatermarkUpdate => write!(f, "watermark_update"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A request to synchronize one connected system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub connected_system_id: ConnectedSystemId,
    pub mode: SyncMode,
    /// Activity that execution items and change records are filed under.
    pub activity_id: ActivityId,
}

impl SyncRequest {
    #[must_use]
    pub fn full(connected_system_id: ConnectedSystemId) -> Self {
        Self {
            connected_system_id,
            mode: SyncMode::Full,
            activity_id: ActivityId::new(),
        }
    }

    #[must_use]
    pub fn delta(connected_system_id: ConnectedSystemId) -> Self {
        Self {
            connected_system_id,
            mode: SyncMode::Delta,
            activity_id: ActivityId::new(),
        }
    }

    #[must_use]
    pub fn with_activity(mut self, activity_id: ActivityId) -> Self {
        self.activity_id = activity_id;
        self
    }
}

/// Runs full and delta synchronizations against a repository.
pub struct SyncRunner {
    repository: Arc<dyn SyncRepository>,
    matcher: Arc<dyn MetaverseObjectMatcher>,
    export_evaluator: Arc<dyn ExportEvaluator>,
    expressions: Arc<dyn ExpressionEvaluator>,
    config: SyncEngineConfig,
    cancellation: CancellationFlag,
}

impl SyncRunner {
    /// Create a runner with attribute matching, rule-based export
    /// evaluation and Rhai expressions.
    #[must_use]
    pub fn new(repository: Arc<dyn SyncRepository>) -> Self {
        Self {
            matcher: Arc::new(AttributeMatcher::new(repository.clone())),
            repository,
            export_evaluator: Arc::new(RuleBasedExportEvaluator::new()),
            expressions: Arc::new(RhaiExpressionEvaluator::new()),
            config: SyncEngineConfig::default(),
            cancellation: CancellationFlag::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: SyncEngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_matcher(mut self, matcher: Arc<dyn MetaverseObjectMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    #[must_use]
    pub fn with_export_evaluator(mut self, evaluator: Arc<dyn ExportEvaluator>) -> Self {
        self.export_evaluator = evaluator;
        self
    }

    #[must_use]
    pub fn with_expression_evaluator(mut self, expressions: Arc<dyn ExpressionEvaluator>) -> Self {
        self.expressions = expressions;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Handle that cancels runs of this runner.
    #[must_use]
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancellation.clone()
    }

    #[must_use]
    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    /// Run a synchronization to completion.
    ///
    /// Never fails: errors that abort the run are reported through the
    /// summary's status and error message. Pages flushed before a failure
    /// or cancellation stay applied.
    #[instrument(skip(self, request), fields(
        connected_system_id = %request.connected_system_id,
        activity_id = %request.activity_id,
        mode = %request.mode,
    ))]
    pub async fn run(&self, request: SyncRequest) -> SyncRunSummary {
        let started_at = Utc::now();
        let mut summary = SyncRunSummary::new(
            request.activity_id,
            request.connected_system_id,
            request.mode,
            started_at,
        );

        info!(dry_run = self.config.dry_run, "Starting synchronization run");

        match self.execute(&request, started_at, &mut summary).await {
            Ok(phase) => summary.status = phase,
            Err(SyncError::Cancelled) => summary.status = SyncRunPhase::Cancelled,
            Err(e) => {
                error!(
                    phase = %summary.status,
                    error = %e,
                    "Synchronization run failed"
                );
                summary.status = SyncRunPhase::Failed;
                summary.error_message = Some(e.to_string());
            }
        }
        summary.completed_at = Some(Utc::now());

        info!(
            status = %summary.status,
            objects_processed = summary.objects_processed,
            pages_processed = summary.pages_processed,
            pending_exports_created = summary.pending_exports_created,
            errors = summary.total_errors(),
            "Synchronization run finished"
        );
        summary
    }

    async fn execute(
        &self,
        request: &SyncRequest,
        started_at: DateTime<Utc>,
        summary: &mut SyncRunSummary,
    ) -> SyncResult<SyncRunPhase> {
        summary.status = SyncRunPhase::Preparing;
        self.config.validate()?;
        let ctx = RunContext::prepare(
            self.repository.as_ref(),
            request,
            self.config.dry_run,
        )
        .await?;

        let watermark = match request.mode {
            SyncMode::Full => None,
            SyncMode::Delta => ctx.system.last_delta_sync_completed_at,
        };
        summary.objects_total = self
            .repository
            .count_connected_system_objects(ctx.system.id, watermark)
            .await?;
        info!(
            objects_total = summary.objects_total,
            watermark = ?watermark,
            page_size = self.config.page_size,
            "Prepared synchronization run"
        );

        let mut cursor = None;
        let mut page_number = 0;
        let mut cross_page: Vec<CrossPageReference> = Vec::new();

        loop {
            if self.cancellation.is_cancelled() {
                warn!(pages_processed = summary.pages_processed, "Synchronization run cancelled");
                return Ok(SyncRunPhase::Cancelled);
            }

            let objects = self
                .repository
                .get_connected_system_objects_page(
                    ctx.system.id,
                    watermark,
                    cursor,
                    self.config.page_size,
                )
                .await?;
            if objects.is_empty() {
                break;
            }

            page_number += 1;
            summary.status = SyncRunPhase::ProcessingPage(page_number);
            cursor = objects.last().map(|c| c.id);
            let full_page = objects.len() == self.config.page_size;

            let outcome = self.process_page(&ctx, page_number, objects).await?;
            summary.objects_processed += outcome.processed;
            summary.pages_processed += 1;
            summary.pending_exports_created += outcome.pending_exports_created;
            summary.no_net_change_count += outcome.no_net_change_count;
            summary.record_all(&outcome.execution_items);
            cross_page.extend(outcome.cross_page);

            if page_number % self.config.progress_update_interval == 0 {
                self.update_progress(&ctx, summary).await?;
            }

            if outcome.cancelled {
                warn!(page = page_number, "Synchronization run cancelled");
                return Ok(SyncRunPhase::Cancelled);
            }
            if !full_page {
                break;
            }
        }

        summary.status = SyncRunPhase::ResolvingCrossPageReferences;
        self.resolve_cross_page_references(&ctx, cross_page, summary)
            .await?;

        summary.status = SyncRunPhase::WatermarkUpdate;
        if !ctx.dry_run {
            self.repository
                .update_delta_sync_watermark(ctx.system.id, started_at)
                .await?;
        }

        Ok(SyncRunPhase::Completed)
    }

    async fn update_progress(&self, ctx: &RunContext, summary: &SyncRunSummary) -> SyncResult<()> {
        if ctx.dry_run {
            return Ok(());
        }
        let progress = RunProgress {
            activity_id: ctx.activity_id,
            connected_system_id: ctx.system.id,
            total_objects: summary.objects_total,
            objects_processed: summary.objects_processed,
            pages_processed: summary.pages_processed,
            updated_at: Utc::now(),
        };
        self.repository.update_run_progress(&progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_mode_roundtrip() {
        for mode in [SyncMode::Full, SyncMode::Delta] {
            assert_eq!(mode.to_string().parse::<SyncMode>().unwrap(), mode);
        }
        assert!("incremental".parse::<SyncMode>().is_err());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(SyncRunPhase::ProcessingPage(3).to_string(), "processing_page_3");
        assert_eq!(
            SyncRunPhase::ResolvingCrossPageReferences.to_string(),
            "resolving_cross_page_references"
        );
        assert!(SyncRunPhase::Cancelled.is_terminal());
        assert!(!SyncRunPhase::WatermarkUpdate.is_terminal());
    }

    #[test]
    fn test_request_constructors() {
        let system = ConnectedSystemId::new();
        let request = SyncRequest::delta(system);
        assert_eq!(request.mode, SyncMode::Delta);
        assert_eq!(request.connected_system_id, system);

        let activity = ActivityId::new();
        assert_eq!(SyncRequest::full(system).with_activity(activity).activity_id, activity);
    }
}
