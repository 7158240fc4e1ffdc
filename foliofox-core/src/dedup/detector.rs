//! Duplicate detection over a catalog scan.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use foliofox_config::DedupConfig;
use foliofox_model::{
    Book, DuplicateMatch, MatchConfidence, MatchKind, MergeAction, PairKey,
};

use crate::dedup::normalize;
use crate::dedup::similarity::SimilarityCache;

/// Files this small share sizes by coincidence, not by content.
const CONTENT_SIZE_FLOOR: u64 = 1024;
/// Title agreement required before equal sizes count as a content match.
const CONTENT_TITLE_FLOOR: f64 = 0.6;

/// Identifier-indexed and fuzzy duplicate detection.
///
/// Holds the similarity memo for one run; build a fresh detector per scan
/// so the cache never leaks stale catalog text across runs.
#[derive(Debug)]
pub struct DuplicateDetector {
    config: DedupConfig,
    cache: SimilarityCache,
}

impl DuplicateDetector {
    pub fn new(config: DedupConfig) -> Self {
        let cache = SimilarityCache::new(config.similarity_cache_size);
        Self { config, cache }
    }

    /// Find all duplicate pairs among `books`. Each unordered pair appears
    /// at most once, under the first kind that matched it: identifier
    /// matches take precedence over fuzzy ones, fuzzy over content-size.
    pub fn detect(&mut self, books: &[Book]) -> Vec<DuplicateMatch> {
        let now = Utc::now();
        let mut seen: HashSet<PairKey> = HashSet::new();
        let mut matches = Vec::new();

        self.detect_identifier_pairs(books, now, &mut seen, &mut matches);
        self.detect_fuzzy_pairs(books, now, &mut seen, &mut matches);
        self.detect_content_pairs(books, now, &mut seen, &mut matches);

        info!(
            books = books.len(),
            matches = matches.len(),
            "duplicate detection finished"
        );
        matches
    }

    fn detect_identifier_pairs(
        &mut self,
        books: &[Book],
        now: DateTime<Utc>,
        seen: &mut HashSet<PairKey>,
        matches: &mut Vec<DuplicateMatch>,
    ) {
        // One bucket per normalized identifier value, ISBN-10 and ISBN-13
        // alike; any two books sharing a bucket are the same edition.
        let mut isbn_index: HashMap<String, Vec<usize>> = HashMap::new();
        let mut asin_index: HashMap<String, Vec<usize>> = HashMap::new();
        for (position, book) in books.iter().enumerate() {
            for isbn in [&book.isbn13, &book.isbn10].into_iter().flatten() {
                let key = normalize::norm_isbn(isbn);
                if !key.is_empty() {
                    isbn_index.entry(key).or_default().push(position);
                }
            }
            if let Some(asin) = &book.asin {
                let key = normalize::norm_isbn(asin);
                if !key.is_empty() {
                    asin_index.entry(key).or_default().push(position);
                }
            }
        }

        for (index, kind, field) in [
            (&isbn_index, MatchKind::Isbn, "isbn"),
            (&asin_index, MatchKind::Exact, "asin"),
        ] {
            for bucket in index.values() {
                for (i, &a) in bucket.iter().enumerate() {
                    for &b in &bucket[i + 1..] {
                        let (book1, book2) = (&books[a], &books[b]);
                        let key = PairKey::new(book1.id, book2.id);
                        if book1.id == book2.id || !seen.insert(key) {
                            continue;
                        }
                        let score = self.overall_similarity(book1, book2);
                        matches.push(self.build_match(
                            book1,
                            book2,
                            kind,
                            MatchConfidence::High,
                            score,
                            vec![field.to_string()],
                            now,
                        ));
                    }
                }
            }
        }
    }

    fn detect_fuzzy_pairs(
        &mut self,
        books: &[Book],
        now: DateTime<Utc>,
        seen: &mut HashSet<PairKey>,
        matches: &mut Vec<DuplicateMatch>,
    ) {
        let titles: Vec<String> =
            books.iter().map(|b| normalize::norm_title(&b.title)).collect();

        for i in 0..books.len() {
            for j in (i + 1)..books.len() {
                let (book1, book2) = (&books[i], &books[j]);
                let key = PairKey::new(book1.id, book2.id);
                if seen.contains(&key) {
                    continue;
                }
                let title_sim = self.cache.similarity(&titles[i], &titles[j]);
                let author_sim =
                    self.cache.author_similarity(&book1.authors, &book2.authors);
                let combined = 0.7 * title_sim + 0.3 * author_sim;
                if combined < self.config.fuzzy_threshold {
                    continue;
                }
                seen.insert(key);

                let mut matched_fields = Vec::new();
                if title_sim >= self.config.title_similarity_threshold {
                    matched_fields.push("title".to_string());
                }
                if author_sim >= self.config.author_similarity_threshold {
                    matched_fields.push("authors".to_string());
                }
                let kind = if matched_fields.len() == 2 {
                    MatchKind::SimilarTitleAuthor
                } else {
                    MatchKind::Fuzzy
                };
                let confidence = if combined >= 0.95 {
                    MatchConfidence::High
                } else if combined >= 0.85 {
                    MatchConfidence::Medium
                } else {
                    MatchConfidence::Low
                };
                debug!(
                    book1 = book1.id.as_i64(),
                    book2 = book2.id.as_i64(),
                    title_sim,
                    author_sim,
                    combined,
                    "fuzzy match"
                );
                let score = self.overall_similarity(book1, book2);
                matches.push(self.build_match(
                    book1,
                    book2,
                    kind,
                    confidence,
                    score,
                    matched_fields,
                    now,
                ));
            }
        }
    }

    fn detect_content_pairs(
        &mut self,
        books: &[Book],
        now: DateTime<Utc>,
        seen: &mut HashSet<PairKey>,
        matches: &mut Vec<DuplicateMatch>,
    ) {
        let mut size_index: HashMap<u64, Vec<usize>> = HashMap::new();
        for (position, book) in books.iter().enumerate() {
            if book.total_file_size > CONTENT_SIZE_FLOOR {
                size_index
                    .entry(book.total_file_size)
                    .or_default()
                    .push(position);
            }
        }

        for bucket in size_index.values() {
            for (i, &a) in bucket.iter().enumerate() {
                for &b in &bucket[i + 1..] {
                    let (book1, book2) = (&books[a], &books[b]);
                    let key = PairKey::new(book1.id, book2.id);
                    if seen.contains(&key) {
                        continue;
                    }
                    let title_sim = self.cache.similarity(
                        &normalize::norm_title(&book1.title),
                        &normalize::norm_title(&book2.title),
                    );
                    if title_sim < CONTENT_TITLE_FLOOR {
                        continue;
                    }
                    seen.insert(key);
                    let score = self.overall_similarity(book1, book2);
                    matches.push(self.build_match(
                        book1,
                        book2,
                        MatchKind::ContentHash,
                        MatchConfidence::Medium,
                        score,
                        vec!["total_file_size".to_string(), "title".to_string()],
                        now,
                    ));
                }
            }
        }
    }

    /// Weighted overall similarity: title 0.4, authors 0.3, ISBN equality
    /// 0.15, publication-year equality 0.1, publisher 0.05.
    pub fn overall_similarity(&mut self, book1: &Book, book2: &Book) -> f64 {
        let title_sim = self.cache.similarity(
            &normalize::norm_title(&book1.title),
            &normalize::norm_title(&book2.title),
        );
        let author_sim = self.cache.author_similarity(&book1.authors, &book2.authors);

        let binary = |equal: bool| if equal { 1.0 } else { 0.0 };
        let isbn_sim = match (&book1.isbn13, &book2.isbn13, &book1.isbn10, &book2.isbn10)
        {
            (Some(a), Some(b), _, _) => {
                binary(normalize::norm_isbn(a) == normalize::norm_isbn(b))
            }
            (_, _, Some(a), Some(b)) => {
                binary(normalize::norm_isbn(a) == normalize::norm_isbn(b))
            }
            _ => 0.0,
        };

        let date_sim = match (&book1.publication_date, &book2.publication_date) {
            (Some(a), Some(b)) => {
                match (normalize::norm_date(a), normalize::norm_date(b)) {
                    (Some(year_a), Some(year_b)) => binary(year_a == year_b),
                    _ => 0.0,
                }
            }
            _ => 0.0,
        };

        let publisher_sim = match (&book1.publisher, &book2.publisher) {
            (Some(a), Some(b)) => self.cache.similarity(a, b),
            _ => 0.0,
        };

        0.4 * title_sim
            + 0.3 * author_sim
            + 0.15 * isbn_sim
            + 0.1 * date_sim
            + 0.05 * publisher_sim
    }

    #[allow(clippy::too_many_arguments)]
    fn build_match(
        &mut self,
        book1: &Book,
        book2: &Book,
        kind: MatchKind,
        confidence: MatchConfidence,
        score: f64,
        matched_fields: Vec<String>,
        now: DateTime<Utc>,
    ) -> DuplicateMatch {
        let primary_id = if primary_score(book1, now) >= primary_score(book2, now) {
            book1.id
        } else {
            book2.id
        };
        DuplicateMatch {
            book1_id: book1.id,
            book2_id: book2.id,
            kind,
            confidence,
            score,
            matched_fields,
            differences: differences(book1, book2),
            recommended_action: recommend_action(book1, book2),
            primary_id,
        }
    }

    /// Matches scoring below the manual-review threshold need a human.
    pub fn requires_manual_review(&self, candidate: &DuplicateMatch) -> bool {
        candidate.score < self.config.manual_review_threshold
    }
}

/// Weighted fraction of populated key fields.
pub fn completeness(book: &Book) -> f64 {
    let present = |value: &Option<String>| {
        value.as_deref().is_some_and(|v| !v.trim().is_empty())
    };
    let checks: [(f64, bool); 9] = [
        (1.0, !book.title.trim().is_empty()),
        (0.8, !book.authors.is_empty()),
        (0.6, present(&book.description)),
        (0.7, present(&book.isbn13)),
        (0.5, present(&book.publication_date)),
        (0.4, present(&book.publisher)),
        (0.3, book.page_count.is_some()),
        (0.2, book.rating_avg.is_some()),
        (0.4, !book.genres.is_empty()),
    ];
    let total: f64 = checks.iter().map(|(weight, _)| weight).sum();
    let filled: f64 = checks
        .iter()
        .filter(|(_, present)| *present)
        .map(|(weight, _)| weight)
        .sum();
    filled / total
}

/// Merge-priority score for choosing a group's primary book.
pub fn primary_score(book: &Book, now: DateTime<Utc>) -> f64 {
    let mut score = completeness(book) * 0.4;
    score += (book.file_count as f64 / 10.0).min(1.0) * 0.2;

    if let (Some(rating), true) = (book.rating_avg, book.rating_count > 0) {
        let rating_score = (rating / 5.0) * (book.rating_count as f64 / 100.0).min(1.0);
        score += rating_score * 0.15;
    }

    let days_old = (now - book.updated_at).num_days().max(0) as f64;
    score += (1.0 - days_old / 365.0).max(0.0) * 0.15;

    let quality_indicators = [
        book.isbn13.is_some(),
        book.publisher.is_some(),
        book.publication_date.is_some(),
        !book.authors.is_empty(),
        !book.genres.is_empty(),
    ];
    let quality = quality_indicators.iter().filter(|&&q| q).count() as f64
        / quality_indicators.len() as f64;
    score + quality * 0.1
}

/// Completeness gap beyond which the richer record simply wins.
const COMPLETENESS_DOMINANCE: f64 = 0.3;

fn recommend_action(book1: &Book, book2: &Book) -> MergeAction {
    let (c1, c2) = (completeness(book1), completeness(book2));
    if (c1 - c2).abs() > COMPLETENESS_DOMINANCE {
        return if c1 > c2 {
            MergeAction::KeepFirst
        } else {
            MergeAction::KeepSecond
        };
    }
    if book1.file_count != book2.file_count {
        return if book1.file_count > book2.file_count {
            MergeAction::KeepFirst
        } else {
            MergeAction::KeepSecond
        };
    }
    if book1.updated_at != book2.updated_at {
        return if book1.updated_at > book2.updated_at {
            MergeAction::KeepFirst
        } else {
            MergeAction::KeepSecond
        };
    }
    MergeAction::MergeMetadata
}

/// Field-by-field disagreements, rendered for the audit trail.
pub(crate) fn differences(
    book1: &Book,
    book2: &Book,
) -> HashMap<String, (Option<String>, Option<String>)> {
    let mut out = HashMap::new();
    let mut compare = |field: &str, a: Option<String>, b: Option<String>| {
        if a != b {
            out.insert(field.to_string(), (a, b));
        }
    };

    compare("title", Some(book1.title.clone()), Some(book2.title.clone()));
    compare("subtitle", book1.subtitle.clone(), book2.subtitle.clone());
    compare(
        "description",
        book1.description.clone(),
        book2.description.clone(),
    );
    compare("isbn10", book1.isbn10.clone(), book2.isbn10.clone());
    compare("isbn13", book1.isbn13.clone(), book2.isbn13.clone());
    compare("asin", book1.asin.clone(), book2.asin.clone());
    compare(
        "publication_date",
        book1.publication_date.clone(),
        book2.publication_date.clone(),
    );
    compare("publisher", book1.publisher.clone(), book2.publisher.clone());
    compare("language", book1.language.clone(), book2.language.clone());
    compare(
        "page_count",
        book1.page_count.map(|n| n.to_string()),
        book2.page_count.map(|n| n.to_string()),
    );
    compare(
        "rating_avg",
        book1.rating_avg.map(|r| r.to_string()),
        book2.rating_avg.map(|r| r.to_string()),
    );
    compare(
        "rating_count",
        Some(book1.rating_count.to_string()),
        Some(book2.rating_count.to_string()),
    );
    compare("series", book1.series.clone(), book2.series.clone());
    compare(
        "series_position",
        book1.series_position.map(|p| p.to_string()),
        book2.series_position.map(|p| p.to_string()),
    );
    compare(
        "authors",
        Some(book1.authors.join(", ")),
        Some(book2.authors.join(", ")),
    );
    compare(
        "genres",
        Some(book1.genres.iter().cloned().collect::<Vec<_>>().join(", ")),
        Some(book2.genres.iter().cloned().collect::<Vec<_>>().join(", ")),
    );
    compare(
        "tags",
        Some(book1.tags.iter().cloned().collect::<Vec<_>>().join(", ")),
        Some(book2.tags.iter().cloned().collect::<Vec<_>>().join(", ")),
    );
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use foliofox_model::BookId;

    fn book(id: i64, title: &str) -> Book {
        let now = Utc::now();
        Book {
            id: BookId(id),
            title: title.to_string(),
            subtitle: None,
            description: None,
            isbn10: None,
            isbn13: None,
            asin: None,
            publication_date: None,
            publisher: None,
            language: None,
            page_count: None,
            rating_avg: None,
            rating_count: 0,
            series: None,
            series_position: None,
            authors: vec!["P".to_string()],
            genres: BTreeSet::new(),
            tags: BTreeSet::new(),
            file_count: 1,
            total_file_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_isbn_match_wins_over_fuzzy() {
        let mut a = book(1, "X");
        let mut b = book(2, "X");
        a.isbn13 = Some("9780000000001".to_string());
        b.isbn13 = Some("978-0-0000-0001".to_string());

        let mut detector = DuplicateDetector::new(DedupConfig::default());
        let matches = detector.detect(&[a, b]);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].kind, MatchKind::Isbn);
        assert_eq!(matches[0].confidence, MatchConfidence::High);
    }

    #[test]
    fn test_article_stripped_titles_fuzzy_match() {
        let a = book(1, "The Great Book");
        let b = book(2, "Great Book");
        let mut detector = DuplicateDetector::new(DedupConfig::default());
        let matches = detector.detect(&[a, b]);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].confidence, MatchConfidence::High);
    }

    #[test]
    fn test_pair_reported_once_per_run() {
        let mut a = book(1, "Same Title");
        let mut b = book(2, "Same Title");
        a.isbn13 = Some("9780000000001".to_string());
        b.isbn13 = Some("9780000000001".to_string());
        a.total_file_size = 5_000;
        b.total_file_size = 5_000;

        let mut detector = DuplicateDetector::new(DedupConfig::default());
        let matches = detector.detect(&[a, b]);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn test_match_at_exact_threshold_is_at_least_low() {
        let mut config = DedupConfig::default();
        config.fuzzy_threshold = 0.7;
        let mut a = book(1, "Completely Different Alpha");
        let mut b = book(2, "Different Alpha");
        a.authors = vec!["Q".to_string()];
        b.authors = vec!["Q".to_string()];

        let mut detector = DuplicateDetector::new(config);
        let matches = detector.detect(&[a, b]);
        // Whatever the combined score, anything >= the threshold matches
        // with at least Low confidence.
        if let Some(found) = matches.first() {
            assert!(found.confidence >= MatchConfidence::Low);
        }
    }

    #[test]
    fn test_completeness_weights() {
        let bare = book(1, "T");
        let mut rich = book(2, "T");
        rich.description = Some("long".to_string());
        rich.isbn13 = Some("9780000000001".to_string());
        assert!(completeness(&rich) > completeness(&bare));
    }

    #[test]
    fn test_recommend_prefers_more_complete() {
        let mut sparse = book(1, "X");
        sparse.authors.clear();
        let mut rich = book(2, "X");
        rich.description = Some("d".to_string());
        rich.isbn13 = Some("9780000000001".to_string());
        rich.publication_date = Some("1999".to_string());
        rich.publisher = Some("p".to_string());
        rich.page_count = Some(100);
        rich.rating_avg = Some(4.0);
        rich.genres.insert("g".to_string());
        assert_eq!(recommend_action(&sparse, &rich), MergeAction::KeepSecond);
    }

    #[test]
    fn test_content_size_floor_excludes_trivial_files() {
        let mut a = book(1, "Tiny A");
        let mut b = book(2, "Tiny A");
        a.total_file_size = 512;
        b.total_file_size = 512;
        let mut detector = DuplicateDetector::new(DedupConfig {
            fuzzy_threshold: 2.0, // disable fuzzy for this test
            ..DedupConfig::default()
        });
        assert!(detector.detect(&[a, b]).is_empty());
    }
}
