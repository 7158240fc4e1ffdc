//! Book deduplication: normalization, fuzzy matching, grouping, merging.

pub mod detector;
pub mod grouping;
pub mod merge;
pub mod normalize;
pub mod similarity;

use chrono::Utc;
use tracing::{info, warn};

use foliofox_config::DedupConfig;
use foliofox_model::{
    DuplicateGroup, DuplicateMatch, MatchConfidence,
};

use crate::catalog::CatalogStore;
use crate::error::Result;

pub use detector::{completeness, primary_score, DuplicateDetector};
pub use grouping::group_matches;
pub use merge::{MergeEngine, MergeOutcome};

/// Result of one on-demand dedup scan.
#[derive(Debug)]
pub struct ScanReport {
    pub books_scanned: usize,
    pub matches: Vec<DuplicateMatch>,
    pub groups: Vec<DuplicateGroup>,
}

/// Summary of an auto-merge pass over a scan's matches.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    pub merged: usize,
    pub skipped_manual_review: usize,
    pub skipped_confidence: usize,
    pub failed: usize,
}

/// On-demand dedup facade over the catalog.
#[derive(Debug)]
pub struct DedupEngine {
    store: CatalogStore,
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(store: CatalogStore, config: DedupConfig) -> Self {
        Self { store, config }
    }

    /// Scan the catalog (optionally capped) and report matches and groups.
    /// The similarity cache lives and dies with this one scan.
    pub async fn scan(&self, limit: Option<u32>) -> Result<ScanReport> {
        let books = self.store.books().list_for_dedup(limit).await?;
        let mut detector = DuplicateDetector::new(self.config.clone());
        let matches = detector.detect(&books);
        let groups = group_matches(&books, &matches, Utc::now());
        Ok(ScanReport {
            books_scanned: books.len(),
            matches,
            groups,
        })
    }

    /// Merge every high-confidence match that clears the manual-review
    /// threshold. Lower-confidence matches stay for a human to judge.
    pub async fn auto_merge(&self, matches: &[DuplicateMatch]) -> Result<MergeSummary> {
        let merger = MergeEngine::new(self.store.clone());
        let mut summary = MergeSummary::default();

        for candidate in matches {
            if candidate.confidence != MatchConfidence::High {
                summary.skipped_confidence += 1;
                continue;
            }
            if candidate.score < self.config.manual_review_threshold {
                summary.skipped_manual_review += 1;
                continue;
            }
            // Either side may already be gone via an earlier merge in this
            // same pass; that is a skip, not an error.
            let books = self.store.books();
            if !books.exists(candidate.book1_id).await?
                || !books.exists(candidate.book2_id).await?
            {
                summary.skipped_manual_review += 1;
                continue;
            }
            match merger.merge_pair(candidate).await {
                Ok(_) => summary.merged += 1,
                Err(err) => {
                    warn!(%err, "merge failed, continuing with remaining pairs");
                    summary.failed += 1;
                }
            }
        }
        info!(?summary, "auto-merge pass finished");
        Ok(summary)
    }
}
