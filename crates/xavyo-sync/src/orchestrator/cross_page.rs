//! Reference resolution across page boundaries.

use tracing::{info, warn};
use xavyo_metaverse::{ConnectedSystemObjectId, ExecutionErrorType};

use crate::batch::CrossPageReference;
use crate::error::SyncResult;
use crate::statistics::SyncRunSummary;

use super::context::RunContext;
use super::page::{apply_reference_outcome, flow_references, record_failure};
use super::SyncRunner;

impl SyncRunner {
    /// Re-run reference flow for objects whose references pointed at objects
    /// on later pages. Runs after every page has been flushed, in chunks.
    /// Flow counts land on the item each object got on its own page.
    pub(super) async fn resolve_cross_page_references(
        &self,
        ctx: &RunContext,
        references: Vec<CrossPageReference>,
        summary: &mut SyncRunSummary,
    ) -> SyncResult<()> {
        if references.is_empty() {
            return Ok(());
        }
        info!(objects = references.len(), "Resolving cross-page references");

        let mut still_unresolved = 0;
        for chunk in references.chunks(self.config.cross_page_batch_size) {
            let ids: Vec<ConnectedSystemObjectId> =
                chunk.iter().map(|r| r.connected_system_object_id).collect();
            let objects = self.repository.get_connected_system_objects(&ids).await?;
            let mut batch = self.load_batch(0, objects).await?;
            for item in chunk.iter().filter_map(|r| r.execution_item.clone()) {
                batch.adopt_execution_item(item);
            }
            let resolver = self.build_resolver(&batch, &ids).await?;

            for reference in chunk {
                let cso_id = reference.connected_system_object_id;
                match flow_references(
                    ctx,
                    self.expressions.as_ref(),
                    &mut batch,
                    cso_id,
                    &reference.sync_rule_ids,
                    &resolver,
                ) {
                    Ok(outcome) => {
                        apply_reference_outcome(ctx, &mut batch, cso_id, &outcome);
                        if outcome.has_unresolved_references() {
                            still_unresolved += 1;
                            warn!(
                                cso_id = %cso_id,
                                unresolved = outcome.unresolved.len(),
                                "References still unresolved after all pages"
                            );
                            batch.record(ctx.error_item(
                                cso_id,
                                ExecutionErrorType::UnresolvedReference,
                                format!(
                                    "{} referenced objects have no metaverse object",
                                    outcome.unresolved.len()
                                ),
                            ));
                        }
                    }
                    Err(e) => record_failure(ctx, &mut batch, cso_id, e)?,
                }
            }

            let flushed = self.flush(ctx, &mut batch).await?;
            summary.pending_exports_created += flushed.pending_exports_created;
            summary.no_net_change_count += flushed.no_net_change_count;
            summary.record_all(&batch.new_execution_items());
        }

        info!(
            resolved = references.len() - still_unresolved,
            unresolved = still_unresolved,
            "Cross-page references resolved"
        );
        Ok(())
    }
}
