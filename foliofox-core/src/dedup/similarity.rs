//! String similarity with a bounded memo cache.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::dedup::normalize;

/// Strings at or above this length skip the Levenshtein pass; the
/// matching-blocks ratio alone is cheaper on long descriptions.
const LEVENSHTEIN_CEILING: usize = 100;

/// Ratcliff–Obershelp ratio: `2·M / (|a| + |b|)` where `M` sums the
/// lengths of recursively found longest common substrings.
pub fn seq_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let matches = matching_total(&a, &b);
    2.0 * matches as f64 / (a.len() + b.len()) as f64
}

fn matching_total(a: &[char], b: &[char]) -> usize {
    let (a_start, b_start, length) = longest_common_run(a, b);
    if length == 0 {
        return 0;
    }
    length
        + matching_total(&a[..a_start], &b[..b_start])
        + matching_total(&a[a_start + length..], &b[b_start + length..])
}

/// Longest common substring via the rolling-row DP.
fn longest_common_run(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut previous = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        let mut current = vec![0usize; b.len() + 1];
        for (j, &cb) in b.iter().enumerate() {
            if ca == cb {
                let run = previous[j] + 1;
                current[j + 1] = run;
                if run > best.2 {
                    best = (i + 1 - run, j + 1 - run, run);
                }
            }
        }
        previous = current;
    }
    best
}

/// Similarity in `[0, 1]`: identical strings are 1.0, empty-vs-empty is
/// 1.0, empty-vs-nonempty is 0.0. Short strings take the better of the
/// ratio and normalized Levenshtein.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let ratio = seq_ratio(a, b);
    if a.chars().count() < LEVENSHTEIN_CEILING && b.chars().count() < LEVENSHTEIN_CEILING {
        ratio.max(strsim::normalized_levenshtein(a, b))
    } else {
        ratio
    }
}

/// Memoized similarity over unordered string pairs, bounded to the
/// configured capacity and shared within one dedup run.
pub struct SimilarityCache {
    cache: LruCache<(String, String), f64>,
}

impl std::fmt::Debug for SimilarityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimilarityCache")
            .field("entries", &self.cache.len())
            .field("capacity", &self.cache.cap())
            .finish()
    }
}

impl SimilarityCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            cache: LruCache::new(capacity),
        }
    }

    pub fn similarity(&mut self, a: &str, b: &str) -> f64 {
        let key = if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        if let Some(&hit) = self.cache.get(&key) {
            return hit;
        }
        let computed = string_similarity(a, b);
        self.cache.put(key, computed);
        computed
    }

    /// Best pairwise similarity across two normalized author lists. Two
    /// empty lists agree perfectly; one empty list agrees not at all.
    pub fn author_similarity(&mut self, authors1: &[String], authors2: &[String]) -> f64 {
        if authors1.is_empty() || authors2.is_empty() {
            return if authors1.is_empty() && authors2.is_empty() {
                1.0
            } else {
                0.0
            };
        }
        let normalized1: Vec<String> =
            authors1.iter().map(|a| normalize::norm_author(a)).collect();
        let normalized2: Vec<String> =
            authors2.iter().map(|a| normalize::norm_author(a)).collect();

        let mut best: f64 = 0.0;
        for a in &normalized1 {
            for b in &normalized2 {
                best = best.max(self.similarity(a, b));
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_ratio_edges() {
        assert_eq!(seq_ratio("", ""), 1.0);
        assert_eq!(seq_ratio("abc", ""), 0.0);
        assert_eq!(seq_ratio("abc", "abc"), 1.0);
    }

    #[test]
    fn test_seq_ratio_partial_overlap() {
        // Shared runs: "ab" and "d" out of 4+4 chars.
        let ratio = seq_ratio("abcd", "abxd");
        assert!((ratio - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_string_similarity_prefers_better_metric() {
        let sim = string_similarity("kitten", "sitting");
        assert!(sim >= 1.0 - 3.0 / 7.0 - 1e-9);
        assert!(sim < 1.0);
    }

    #[test]
    fn test_cache_is_order_insensitive() {
        let mut cache = SimilarityCache::new(16);
        let ab = cache.similarity("great book", "great look");
        let ba = cache.similarity("great look", "great book");
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_author_similarity_handles_empty_lists() {
        let mut cache = SimilarityCache::new(16);
        assert_eq!(cache.author_similarity(&[], &[]), 1.0);
        assert_eq!(
            cache.author_similarity(&["P".to_string()], &[]),
            0.0
        );
    }

    #[test]
    fn test_author_similarity_matches_reordered_names() {
        let mut cache = SimilarityCache::new(16);
        let sim = cache.author_similarity(
            &["Le Guin, Ursula K.".to_string()],
            &["Ursula K. Le Guin".to_string()],
        );
        assert_eq!(sim, 1.0);
    }
}
