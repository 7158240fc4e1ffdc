//! Transactional merging of duplicate book rows.

use chrono::Utc;
use sqlx::Row;
use tracing::info;

use foliofox_model::{BookId, DuplicateMatch, MergeAction};

use crate::catalog::{CatalogStore, LogLevel};
use crate::dedup::detector::primary_score;
use crate::error::{FolioError, Result};

const COMPONENT: &str = "dedup_merge";

/// Result of absorbing one secondary row into a primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub primary: BookId,
    pub removed: BookId,
}

/// Applies merges decided by the detector. All row movement happens in a
/// single transaction per pair; a failure before commit leaves the catalog
/// untouched.
#[derive(Clone, Debug)]
pub struct MergeEngine {
    store: CatalogStore,
}

impl MergeEngine {
    pub fn new(store: CatalogStore) -> Self {
        Self { store }
    }

    /// Merge one matched pair. The match's `primary_id` absorbs the other
    /// book: every referencing row is redirected, metadata gaps are filled
    /// when the recommendation calls for it, and the secondary row is
    /// deleted.
    pub async fn merge_pair(&self, candidate: &DuplicateMatch) -> Result<MergeOutcome> {
        let primary_id = candidate.primary_id;
        let secondary_id = if primary_id == candidate.book1_id {
            candidate.book2_id
        } else {
            candidate.book1_id
        };

        let books = self.store.books();
        let primary = books.get(primary_id).await?.ok_or_else(|| {
            FolioError::NotFound(format!("merge primary book {primary_id}"))
        })?;
        let secondary = books.get(secondary_id).await?.ok_or_else(|| {
            FolioError::NotFound(format!("merge secondary book {secondary_id}"))
        })?;

        let now = Utc::now();
        let scores = (
            primary_score(&primary, now),
            primary_score(&secondary, now),
        );

        let mut tx = self.store.pool().begin().await?;

        // Redirect every row that referenced the secondary book.
        for table in ["book_files", "download_history", "download_queue"] {
            let sql = format!("UPDATE {table} SET book_id = ? WHERE book_id = ?");
            sqlx::query(&sql)
                .bind(primary_id.as_i64())
                .bind(secondary_id.as_i64())
                .execute(&mut *tx)
                .await?;
        }

        if candidate.recommended_action == MergeAction::MergeMetadata {
            fill_metadata_gaps(&mut tx, &primary, &secondary).await?;
        }
        adopt_missing_joins(&mut tx, primary_id, secondary_id).await?;

        // Combined holdings live on the surviving row.
        sqlx::query(
            "UPDATE books SET \
                 file_count = file_count + ?, \
                 total_file_size = total_file_size + ?, \
                 updated_at = ? \
             WHERE id = ?",
        )
        .bind(secondary.file_count as i64)
        .bind(secondary.total_file_size as i64)
        .bind(now)
        .bind(primary_id.as_i64())
        .execute(&mut *tx)
        .await?;

        // Join rows first, then the book row itself.
        for table in ["book_authors", "book_genres", "book_tags"] {
            let sql = format!("DELETE FROM {table} WHERE book_id = ?");
            sqlx::query(&sql)
                .bind(secondary_id.as_i64())
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM books WHERE id = ?")
            .bind(secondary_id.as_i64())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(%primary_id, %secondary_id, "merged duplicate books");
        self.store
            .logs()
            .record(
                LogLevel::Info,
                COMPONENT,
                &format!("merged book {secondary_id} into {primary_id}"),
                Some(serde_json::json!({
                    "primary_id": primary_id.as_i64(),
                    "secondary_id": secondary_id.as_i64(),
                    "primary_score": scores.0,
                    "secondary_score": scores.1,
                    "kind": candidate.kind,
                    "score": candidate.score,
                })),
            )
            .await?;

        Ok(MergeOutcome {
            primary: primary_id,
            removed: secondary_id,
        })
    }
}

/// Fill null/empty scalar fields on the primary from the secondary. The
/// description prefers the longer text; the rating moves only when the
/// secondary's sample is strictly larger.
async fn fill_metadata_gaps(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    primary: &foliofox_model::Book,
    secondary: &foliofox_model::Book,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE books SET
            subtitle = COALESCE(NULLIF(subtitle, ''), ?),
            isbn10 = COALESCE(NULLIF(isbn10, ''), ?),
            isbn13 = COALESCE(NULLIF(isbn13, ''), ?),
            asin = COALESCE(NULLIF(asin, ''), ?),
            publication_date = COALESCE(NULLIF(publication_date, ''), ?),
            page_count = COALESCE(page_count, ?),
            series_position = COALESCE(series_position, ?),
            publisher_id = COALESCE(publisher_id,
                (SELECT id FROM publishers WHERE name = ?)),
            language_id = COALESCE(language_id,
                (SELECT id FROM languages WHERE code = ?)),
            series_id = COALESCE(series_id,
                (SELECT id FROM series WHERE name = ?))
        WHERE id = ?
        "#,
    )
    .bind(&secondary.subtitle)
    .bind(&secondary.isbn10)
    .bind(&secondary.isbn13)
    .bind(&secondary.asin)
    .bind(&secondary.publication_date)
    .bind(secondary.page_count.map(|n| n as i64))
    .bind(secondary.series_position)
    .bind(&secondary.publisher)
    .bind(&secondary.language)
    .bind(&secondary.series)
    .bind(primary.id.as_i64())
    .execute(&mut **tx)
    .await?;

    let primary_len = primary.description.as_deref().map_or(0, str::len);
    let secondary_len = secondary.description.as_deref().map_or(0, str::len);
    if secondary_len > primary_len {
        sqlx::query("UPDATE books SET description = ? WHERE id = ?")
            .bind(&secondary.description)
            .bind(primary.id.as_i64())
            .execute(&mut **tx)
            .await?;
    }

    if secondary.rating_count > primary.rating_count {
        sqlx::query("UPDATE books SET rating_avg = ?, rating_count = ? WHERE id = ?")
            .bind(secondary.rating_avg)
            .bind(secondary.rating_count as i64)
            .bind(primary.id.as_i64())
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Move the secondary's author/genre/tag joins over wherever the primary
/// has none of its own.
async fn adopt_missing_joins(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    primary_id: BookId,
    secondary_id: BookId,
) -> Result<()> {
    for table in ["book_authors", "book_genres", "book_tags"] {
        let count_sql = format!("SELECT COUNT(*) AS n FROM {table} WHERE book_id = ?");
        let row = sqlx::query(&count_sql)
            .bind(primary_id.as_i64())
            .fetch_one(&mut **tx)
            .await?;
        let primary_rows: i64 = row.try_get("n")?;
        if primary_rows == 0 {
            let move_sql = format!("UPDATE {table} SET book_id = ? WHERE book_id = ?");
            sqlx::query(&move_sql)
                .bind(primary_id.as_i64())
                .bind(secondary_id.as_i64())
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}
