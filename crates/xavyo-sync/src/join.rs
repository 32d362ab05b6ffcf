//! Join and projection.
//!
//! A connected system object joins at most one metaverse object, and a
//! metaverse object holds at most one joined object per connected system.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use xavyo_metaverse::{
    ConnectedSystemObject, JoinType, MetaverseObject, MetaverseObjectId, SyncRule,
};

use crate::batch::PageBatch;
use crate::error::SyncResult;
use crate::flow::projected_values;
use crate::repository::SyncRepository;

/// Result of one matching attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    Matched(MetaverseObjectId),
    NoMatch,
    MultipleMatches(Vec<MetaverseObjectId>),
}

/// Finds the metaverse object a connected system object corresponds to.
#[async_trait]
pub trait MetaverseObjectMatcher: Send + Sync {
    async fn find_matching_metaverse_object(
        &self,
        cso: &ConnectedSystemObject,
        rule: &SyncRule,
    ) -> SyncResult<MatchResult>;
}

/// Matcher driven by a rule's object matching rules.
///
/// Matching rules are tried in order; the first one whose values find any
/// candidate decides. Only stored metaverse objects are candidates.
pub struct AttributeMatcher {
    repository: Arc<dyn SyncRepository>,
}

impl AttributeMatcher {
    #[must_use]
    pub fn new(repository: Arc<dyn SyncRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl MetaverseObjectMatcher for AttributeMatcher {
    #[instrument(skip(self, cso, rule), fields(cso_id = %cso.id, rule = %rule.name))]
    async fn find_matching_metaverse_object(
        &self,
        cso: &ConnectedSystemObject,
        rule: &SyncRule,
    ) -> SyncResult<MatchResult> {
        for matching in &rule.object_matching_rules {
            let mut candidates: Vec<MetaverseObjectId> = Vec::new();
            for value in cso.effective_values(matching.connected_system_attribute_id) {
                let found = self
                    .repository
                    .find_metaverse_objects_by_attribute(
                        rule.metaverse_object_type_id,
                        matching.metaverse_attribute_id,
                        &value,
                    )
                    .await?;
                for id in found {
                    if !candidates.contains(&id) {
                        candidates.push(id);
                    }
                }
            }

            match candidates.len() {
                0 => continue,
                1 => return Ok(MatchResult::Matched(candidates[0])),
                _ => return Ok(MatchResult::MultipleMatches(candidates)),
            }
        }
        Ok(MatchResult::NoMatch)
    }
}

/// Outcome of trying to join an unjoined object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// A single candidate with a free slot for this connected system.
    Joined(MetaverseObjectId),
    /// No rule found a candidate.
    NoMatch,
    /// Matching found more than one candidate.
    AmbiguousMatch(Vec<MetaverseObjectId>),
    /// The candidate already holds an object of this connected system.
    AlreadyJoined(MetaverseObjectId),
}

/// Try each in-scope rule in order; the first rule that finds a match decides.
///
/// The existing-join check accounts for joins and disconnects made earlier
/// in the same page that are not yet flushed.
/// Objects projected earlier in the page are candidates as well.
pub async fn try_join(
    cso: &ConnectedSystemObject,
    rules: &[&SyncRule],
    matcher: &dyn MetaverseObjectMatcher,
    repository: &dyn SyncRepository,
    batch: &PageBatch,
) -> SyncResult<JoinOutcome> {
    for rule in rules {
        if rule.object_matching_rules.is_empty() {
            continue;
        }
        let result = match matcher.find_matching_metaverse_object(cso, rule).await? {
            MatchResult::NoMatch => match_staged_projections(cso, rule, batch),
            found => found,
        };
        match result {
            MatchResult::NoMatch => continue,
            MatchResult::MultipleMatches(candidates) => {
                return Ok(JoinOutcome::AmbiguousMatch(candidates))
            }
            MatchResult::Matched(mvo_id) => {
                let stored = repository.get_joined_connected_system_objects(&[mvo_id]).await?;
                let existing = batch.effective_join_count(
                    mvo_id,
                    Some(cso.connected_system_id),
                    stored,
                    cso.id,
                );
                debug!(
                    cso_id = %cso.id,
                    mvo_id = %mvo_id,
                    existing_joins = existing,
                    "Matched metaverse object"
                );
                if existing > 0 {
                    return Ok(JoinOutcome::AlreadyJoined(mvo_id));
                }
                return Ok(JoinOutcome::Joined(mvo_id));
            }
        }
    }
    Ok(JoinOutcome::NoMatch)
}

/// Match against metaverse objects projected earlier in the same page,
/// which no stored lookup can see before the flush.
fn match_staged_projections(
    cso: &ConnectedSystemObject,
    rule: &SyncRule,
    batch: &PageBatch,
) -> MatchResult {
    for matching in &rule.object_matching_rules {
        let values = cso.effective_values(matching.connected_system_attribute_id);
        if values.is_empty() {
            continue;
        }
        let candidates: Vec<MetaverseObjectId> = batch
            .staged_projections()
            .filter(|mvo| mvo.type_id == rule.metaverse_object_type_id)
            .filter(|mvo| {
                let staged = projected_values(mvo, matching.metaverse_attribute_id);
                values.iter().any(|v| staged.contains(v))
            })
            .map(|mvo| mvo.id)
            .collect();

        match candidates.len() {
            0 => continue,
            1 => return MatchResult::Matched(candidates[0]),
            _ => return MatchResult::MultipleMatches(candidates),
        }
    }
    MatchResult::NoMatch
}

/// Join an object to an existing metaverse object, clearing any pending
/// deletion marker. Returns whether a marker was cleared.
pub fn join(cso: &mut ConnectedSystemObject, mvo: &mut MetaverseObject, now: DateTime<Utc>) -> bool {
    cso.join_to(mvo.id, JoinType::Joined, now);
    mvo.clear_deletion_marker()
}

/// Create a new metaverse object from an object and join it as projected.
///
/// No attributes are flowed here; flow runs as a separate step for joined
/// and projected objects alike.
#[must_use]
pub fn project(cso: &mut ConnectedSystemObject, rule: &SyncRule, now: DateTime<Utc>) -> MetaverseObject {
    let mvo = MetaverseObject::project(rule.metaverse_object_type_id, now);
    cso.join_to(mvo.id, JoinType::Projected, now);
    mvo
}
