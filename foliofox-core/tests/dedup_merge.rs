//! Dedup scenarios end to end: detection over the catalog, grouping, and
//! the merge transaction's row movement.

use std::collections::BTreeSet;

use chrono::Utc;
use tempfile::TempDir;

use foliofox_config::{DatabaseConfig, DedupConfig};
use foliofox_core::catalog::CatalogStore;
use foliofox_core::dedup::DedupEngine;
use foliofox_model::{Book, BookId, MatchConfidence, MatchKind};

async fn file_store() -> (TempDir, CatalogStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DatabaseConfig {
        path: dir.path().join("foliofox.db"),
        ..DatabaseConfig::default()
    };
    let store = CatalogStore::connect(&config).await.expect("connect");
    (dir, store)
}

fn base_book(title: &str) -> Book {
    let now = Utc::now();
    Book {
        id: BookId(0),
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
        total_file_size: 10_000,
        created_at: now,
        updated_at: now,
    }
}

/// Scenario: two books share an ISBN modulo formatting; the richer record
/// absorbs the sparser one, keeping its description and combined files.
#[tokio::test]
async fn isbn_duplicate_merges_into_higher_completeness() {
    let (_dir, store) = file_store().await;
    let books = store.books();

    let mut sparse = base_book("X");
    sparse.isbn13 = Some("9780000000001".to_string());
    sparse.rating_avg = Some(4.0);
    sparse.rating_count = 10;
    let sparse_id = books.insert(&sparse).await.expect("insert sparse");

    let mut rich = base_book("X");
    rich.isbn13 = Some("978-0-0000-0001".to_string());
    rich.description = Some("Long description with real substance.".to_string());
    rich.rating_avg = Some(4.5);
    rich.rating_count = 100;
    let rich_id = books.insert(&rich).await.expect("insert rich");

    let engine = DedupEngine::new(store.clone(), DedupConfig::default());
    let report = engine.scan(None).await.expect("scan");

    assert_eq!(report.matches.len(), 1);
    let found = &report.matches[0];
    assert_eq!(found.kind, MatchKind::Isbn);
    assert_eq!(found.confidence, MatchConfidence::High);
    assert_eq!(found.primary_id, rich_id);

    let summary = engine.auto_merge(&report.matches).await.expect("merge");
    assert_eq!(summary.merged, 1);

    // The sparse row is gone; the rich row carries the merged holdings.
    assert!(books.get(sparse_id).await.expect("get").is_none());
    let merged = books.get(rich_id).await.expect("get").expect("present");
    assert_eq!(merged.file_count, 2);
    assert_eq!(merged.total_file_size, 20_000);
    assert_eq!(
        merged.description.as_deref(),
        Some("Long description with real substance.")
    );
    assert_eq!(merged.rating_count, 100);
}

/// Merge invariant: every referencing row moves to the primary and no
/// join rows survive for the removed book.
#[tokio::test]
async fn merge_leaves_no_orphans() {
    let (_dir, store) = file_store().await;
    let books = store.books();

    let mut keep = base_book("Shared Title");
    keep.isbn13 = Some("9780000000002".to_string());
    keep.description = Some("kept".to_string());
    let keep_id = books.insert(&keep).await.expect("insert");

    let mut remove = base_book("Shared Title");
    remove.isbn13 = Some("9780000000002".to_string());
    remove.genres = BTreeSet::from(["fantasy".to_string()]);
    let remove_id = books.insert(&remove).await.expect("insert");

    // A file row referencing the doomed book.
    sqlx::query(
        "INSERT INTO book_files (book_id, file_path, file_size_bytes, created_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(remove_id.as_i64())
    .bind("/books/shared.epub")
    .bind(9_000_i64)
    .bind(Utc::now())
    .execute(store.pool())
    .await
    .expect("file row");

    let engine = DedupEngine::new(store.clone(), DedupConfig::default());
    let report = engine.scan(None).await.expect("scan");
    let summary = engine.auto_merge(&report.matches).await.expect("merge");
    assert_eq!(summary.merged, 1);

    use sqlx::Row;
    let moved = sqlx::query("SELECT book_id FROM book_files WHERE file_path = ?")
        .bind("/books/shared.epub")
        .fetch_one(store.pool())
        .await
        .expect("file moved");
    let owner: i64 = moved.try_get("book_id").expect("owner");
    assert_eq!(owner, keep_id.as_i64());

    for table in ["book_authors", "book_genres", "book_tags"] {
        let sql = format!("SELECT COUNT(*) AS n FROM {table} WHERE book_id = ?");
        let row = sqlx::query(&sql)
            .bind(remove_id.as_i64())
            .fetch_one(store.pool())
            .await
            .expect("count");
        let orphans: i64 = row.try_get("n").expect("n");
        assert_eq!(orphans, 0, "orphan joins in {table}");
    }
}

/// Article-stripped titles with the same author fuzzy-match at high
/// confidence.
#[tokio::test]
async fn article_stripped_titles_match_high() {
    let (_dir, store) = file_store().await;
    let books = store.books();
    books
        .insert(&base_book("The Great Book"))
        .await
        .expect("insert");
    books.insert(&base_book("Great Book")).await.expect("insert");

    let engine = DedupEngine::new(store.clone(), DedupConfig::default());
    let report = engine.scan(None).await.expect("scan");
    assert_eq!(report.matches.len(), 1);
    assert_eq!(report.matches[0].confidence, MatchConfidence::High);
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].duplicates.len(), 1);
}

/// Low-scoring matches stay for manual review instead of auto-merging.
#[tokio::test]
async fn manual_review_threshold_blocks_weak_merges() {
    let (_dir, store) = file_store().await;
    let books = store.books();

    // Same ISBN but wildly different titles and authors: identifier match
    // with a weak overall score.
    let mut a = base_book("Completely Different Title Alpha");
    a.isbn13 = Some("9780000000003".to_string());
    a.authors = vec!["Someone".to_string()];
    books.insert(&a).await.expect("insert");

    let mut b = base_book("Unrelated Words Entirely Beta");
    b.isbn13 = Some("9780000000003".to_string());
    b.authors = vec!["Other Person".to_string()];
    books.insert(&b).await.expect("insert");

    let engine = DedupEngine::new(store.clone(), DedupConfig::default());
    let report = engine.scan(None).await.expect("scan");
    assert_eq!(report.matches.len(), 1);

    let summary = engine.auto_merge(&report.matches).await.expect("merge pass");
    assert_eq!(summary.merged, 0);
    assert_eq!(summary.skipped_manual_review, 1);
    assert_eq!(store.books().list_for_dedup(None).await.expect("list").len(), 2);
}
