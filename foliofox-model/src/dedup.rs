use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::book::Book;
use crate::ids::BookId;

/// How a pair of books was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// ASIN equality.
    Exact,
    /// Combined title/author similarity above the fuzzy threshold.
    Fuzzy,
    /// ISBN-10 or ISBN-13 equality after normalization.
    Isbn,
    /// Equal non-trivial file size plus moderately similar titles.
    ContentHash,
    /// Title and author each above their own per-field thresholds.
    SimilarTitleAuthor,
}

/// Confidence band attached to a match.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MatchConfidence {
    Low,
    Medium,
    High,
}

/// What the detector recommends doing with a matched pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
    /// Keep the first book of the pair, absorb the second.
    KeepFirst,
    /// Keep the second book of the pair, absorb the first.
    KeepSecond,
    /// Neither side dominates; fill gaps on the primary from the secondary.
    MergeMetadata,
}

/// Canonical unordered pair key: `(min(id), max(id))`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PairKey(pub BookId, pub BookId);

impl PairKey {
    pub fn new(a: BookId, b: BookId) -> Self {
        if a <= b { PairKey(a, b) } else { PairKey(b, a) }
    }
}

/// One detected duplicate pair. Transient: never persisted except as a
/// merge audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateMatch {
    pub book1_id: BookId,
    pub book2_id: BookId,
    pub kind: MatchKind,
    pub confidence: MatchConfidence,
    /// Overall weighted similarity in `[0, 1]`.
    pub score: f64,
    pub matched_fields: Vec<String>,
    /// Field name to (book1 value, book2 value) where the pair disagrees.
    pub differences: HashMap<String, (Option<String>, Option<String>)>,
    pub recommended_action: MergeAction,
    /// The member that should absorb the other.
    pub primary_id: BookId,
}

impl DuplicateMatch {
    pub fn pair_key(&self) -> PairKey {
        PairKey::new(self.book1_id, self.book2_id)
    }
}

/// Per-member guidance inside a [`DuplicateGroup`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSuggestion {
    pub book_id: BookId,
    pub keep: bool,
    /// Fields whose values conflict with the chosen primary.
    pub conflicting_fields: Vec<String>,
}

/// Connected component of matched pairs with at least two members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub group_id: uuid::Uuid,
    pub primary: Book,
    pub duplicates: Vec<Book>,
    pub total_matches: usize,
    pub highest_confidence: MatchConfidence,
    pub merge_suggestions: Vec<MergeSuggestion>,
    /// Σ total_file_size over the non-primary members.
    pub estimated_space_saved: u64,
}
