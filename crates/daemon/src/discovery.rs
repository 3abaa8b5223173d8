//! Candidate discovery across configured content sources.
//!
//! Applies the coarse filters that only need listing metadata (engagement,
//! declared duration, dedup state). Authoritative media checks happen later
//! in the suitability gate.

use crate::source::{ContentSource, SourceItem};
use crate::state::StateStore;
use rand::seq::SliceRandom;
use reelrelay_config::DiscoveryConfig;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A discovered item not yet retrieved.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub source_id: String,
    pub source_url: String,
    pub title: String,
    pub engagement_score: i64,
    pub comment_count: i64,
    pub declared_duration: Option<f64>,
    /// Label of the source that produced it.
    pub source_name: String,
}

impl Candidate {
    fn from_item(item: SourceItem, source_name: &str) -> Self {
        Self {
            source_id: item.id,
            source_url: item.url,
            title: item.title,
            engagement_score: item.score,
            comment_count: item.comment_count,
            declared_duration: item.declared_duration,
            source_name: source_name.to_string(),
        }
    }
}

/// Listing-level thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub page_limit: u32,
    pub min_score: i64,
    pub min_comments: i64,
    pub min_declared_duration: f64,
    pub max_declared_duration: f64,
}

impl From<&DiscoveryConfig> for Thresholds {
    fn from(cfg: &DiscoveryConfig) -> Self {
        Self {
            page_limit: cfg.page_limit,
            min_score: cfg.min_score,
            min_comments: cfg.min_comments,
            min_declared_duration: cfg.min_declared_duration,
            max_declared_duration: cfg.max_declared_duration,
        }
    }
}

/// Why a listed item was dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Exclusion {
    LowScore,
    FewComments,
    DeclaredDurationOutOfRange,
    AlreadySeen,
    BlockedUrl,
}

/// Checks a listed item against thresholds and dedup state.
///
/// A missing declared duration passes; only a present, out-of-range value excludes.
pub fn screen_item(
    item: &SourceItem,
    thresholds: &Thresholds,
    state: &StateStore,
) -> Result<(), Exclusion> {
    if state.is_seen(&item.id) {
        return Err(Exclusion::AlreadySeen);
    }
    if state.is_blocked(&item.url) {
        return Err(Exclusion::BlockedUrl);
    }
    if item.score < thresholds.min_score {
        return Err(Exclusion::LowScore);
    }
    if item.comment_count < thresholds.min_comments {
        return Err(Exclusion::FewComments);
    }
    if let Some(duration) = item.declared_duration {
        if duration < thresholds.min_declared_duration
            || duration > thresholds.max_declared_duration
        {
            return Err(Exclusion::DeclaredDurationOutOfRange);
        }
    }
    Ok(())
}

/// Queries every source and returns fresh candidates in source order.
///
/// A failing source is logged and skipped. If all sources fail the result is empty.
pub async fn discover(
    sources: &[Arc<dyn ContentSource>],
    thresholds: &Thresholds,
    state: &StateStore,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let mut ids = HashSet::new();
    let mut urls = HashSet::new();

    for source in sources {
        let items = match source.search(thresholds.page_limit).await {
            Ok(items) => items,
            Err(e) => {
                warn!(source = source.name(), error = %e, "Source failed, continuing with others");
                continue;
            }
        };

        let listed = items.len();
        let mut kept = 0usize;

        for item in items {
            if let Err(reason) = screen_item(&item, thresholds, state) {
                debug!(source = source.name(), id = %item.id, ?reason, "Excluded listing item");
                continue;
            }
            if !ids.insert(item.id.clone()) || !urls.insert(item.url.clone()) {
                continue;
            }
            kept += 1;
            candidates.push(Candidate::from_item(item, source.name()));
        }

        debug!(source = source.name(), listed, kept, "Screened listing");
    }

    info!(count = candidates.len(), "Discovery finished");
    candidates
}

/// Randomizes candidate order so one source does not dominate the batch.
pub fn shuffle(candidates: &mut [Candidate]) {
    candidates.shuffle(&mut rand::rng());
}
