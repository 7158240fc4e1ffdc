//! Connected-component grouping of duplicate matches.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use foliofox_model::{
    Book, BookId, DuplicateGroup, DuplicateMatch, MatchConfidence, MergeSuggestion,
};

use crate::dedup::detector::{differences, primary_score};

/// Union-find over book ids.
#[derive(Debug, Default)]
struct DisjointSets {
    parent: HashMap<BookId, BookId>,
}

impl DisjointSets {
    fn find(&mut self, id: BookId) -> BookId {
        let parent = *self.parent.entry(id).or_insert(id);
        if parent == id {
            return id;
        }
        let root = self.find(parent);
        self.parent.insert(id, root);
        root
    }

    fn union(&mut self, a: BookId, b: BookId) {
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a != root_b {
            self.parent.insert(root_b, root_a);
        }
    }
}

/// Build one [`DuplicateGroup`] per connected component with at least two
/// members. The primary is the member with the best merge-priority score.
pub fn group_matches(
    books: &[Book],
    matches: &[DuplicateMatch],
    now: DateTime<Utc>,
) -> Vec<DuplicateGroup> {
    let mut sets = DisjointSets::default();
    for pair in matches {
        sets.union(pair.book1_id, pair.book2_id);
    }

    let mut members: HashMap<BookId, Vec<&Book>> = HashMap::new();
    let mut confidences: HashMap<BookId, MatchConfidence> = HashMap::new();
    let mut match_counts: HashMap<BookId, usize> = HashMap::new();

    for pair in matches {
        let root = sets.find(pair.book1_id);
        *match_counts.entry(root).or_insert(0) += 1;
        confidences
            .entry(root)
            .and_modify(|best| *best = (*best).max(pair.confidence))
            .or_insert(pair.confidence);
    }
    for book in books {
        let root = sets.find(book.id);
        if match_counts.contains_key(&root) {
            members.entry(root).or_default().push(book);
        }
    }

    let mut groups = Vec::new();
    for (root, group_books) in members {
        if group_books.len() < 2 {
            continue;
        }
        let primary = group_books
            .iter()
            .copied()
            .max_by(|a, b| {
                primary_score(a, now)
                    .partial_cmp(&primary_score(b, now))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Deterministic tie-break on the lower id.
                    .then_with(|| b.id.cmp(&a.id))
            })
            .expect("non-empty group");

        let duplicates: Vec<Book> = group_books
            .iter()
            .filter(|b| b.id != primary.id)
            .map(|b| (*b).clone())
            .collect();
        let estimated_space_saved =
            duplicates.iter().map(|b| b.total_file_size).sum();

        let merge_suggestions = group_books
            .iter()
            .map(|book| MergeSuggestion {
                book_id: book.id,
                keep: book.id == primary.id,
                conflicting_fields: if book.id == primary.id {
                    Vec::new()
                } else {
                    let mut fields: Vec<String> =
                        differences(primary, book).into_keys().collect();
                    fields.sort();
                    fields
                },
            })
            .collect();

        groups.push(DuplicateGroup {
            group_id: uuid::Uuid::new_v4(),
            primary: primary.clone(),
            duplicates,
            total_matches: match_counts.get(&root).copied().unwrap_or(0),
            highest_confidence: confidences
                .get(&root)
                .copied()
                .unwrap_or(MatchConfidence::Low),
            merge_suggestions,
            estimated_space_saved,
        });
    }
    // Deterministic output order for reports and tests.
    groups.sort_by_key(|g| g.primary.id);
    groups
}
