//! # Sync Engine
//!
//! Reconciles connected system objects with the metaverse for xavyo
//! identity synchronization.
//!
//! A run over one connected system:
//! - **Confirms** executed pending exports against freshly imported values
//! - **Tears down** obsolete objects, applying the metaverse object's deletion rule
//! - **Scopes** each object against the system's import rules
//! - **Joins** it to an existing metaverse object, or **projects** a new one
//! - **Flows** attributes inbound, references last so that every object of
//!   the page has a metaverse object to point at
//! - **Evaluates exports** for every metaverse object that changed, and
//!   **enforces state** on objects of systems with enforcing export rules
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   page   ┌──────────────┐  flush  ┌──────────────────┐
//! │ SyncRunner   │─────────►│  PageBatch   │────────►│  SyncRepository  │
//! │ (orchestrator│          │ (arena +     │         │  (Postgres or    │
//! │  full/delta) │          │  deferred    │         │   in-memory)     │
//! └──────┬───────┘          │  writes)     │         └──────────────────┘
//!        │                  └──────────────┘
//!        ▼
//! scope ─► join/project ─► flow ─► export evaluation ─► drift
//! ```
//!
//! Writes are deferred to the end of each page and issued as a handful of
//! batched repository calls.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use xavyo_sync::{PgSyncRepository, SyncEngineConfig, SyncRequest, SyncRunner};
//!
//! let repository = Arc::new(PgSyncRepository::new(pool));
//! let runner = SyncRunner::new(repository)
//!     .with_config(SyncEngineConfig::default().with_page_size(1000));
//!
//! let summary = runner.run(SyncRequest::delta(connected_system_id)).await;
//! println!("{} objects, status {}", summary.objects_processed, summary.status);
//! ```

pub mod batch;
pub mod cancellation;
pub mod config;
pub mod deletion;
pub mod drift;
pub mod error;
pub mod export;
pub mod expression;
pub mod flow;
pub mod join;
pub mod orchestrator;
pub mod repository;
pub mod scope;
pub mod statistics;

pub use batch::{CrossPageReference, PageBatch, QueuedDeletion};
pub use cancellation::CancellationFlag;
pub use config::SyncEngineConfig;
pub use deletion::{on_disconnect, DeletionDecision};
pub use drift::{evaluate_drift, DriftContext, DriftResult, ImportContributorCache};
pub use error::{SyncError, SyncResult};
pub use export::{
    confirm_pending_exports, ConfirmationOutcome, ExportContext, ExportEvaluation,
    ExportEvaluator, ExportReferenceMap, RuleBasedExportEvaluator,
};
pub use expression::{
    ExpressionConfig, ExpressionContext, ExpressionEvaluator, ExpressionOutput,
    RhaiExpressionEvaluator,
};
pub use flow::{FlowOutcome, FlowPass, ReferenceResolver};
pub use join::{AttributeMatcher, JoinOutcome, MatchResult, MetaverseObjectMatcher};
pub use orchestrator::{SyncMode, SyncRequest, SyncRunPhase, SyncRunner};
pub use repository::{InMemorySyncRepository, PgSyncRepository, RunProgress, SyncRepository};
pub use scope::{evaluate_scope, ScopeDecision};
pub use statistics::SyncRunSummary;
