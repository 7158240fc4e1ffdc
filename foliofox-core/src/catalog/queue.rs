use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use foliofox_model::{
    BookId, DownloadItem, DownloadStatus, IndexerId, QueueItemId, QueueStats, UserId,
};

use crate::error::Result;

/// Typed access to `download_queue`, `download_history`, and
/// `download_stats`.
#[derive(Clone, Debug)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new queue row. Status starts `pending`; ids are assigned by
    /// the catalog.
    pub async fn enqueue(&self, item: &DownloadItem) -> Result<QueueItemId> {
        item.validate()?;
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO download_queue (
                user_id, book_id, indexer_id, title, author, url, format,
                size_bytes, priority, status, progress_pct, retry_count,
                max_retries, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, 0, ?, ?, ?)
            "#,
        )
        .bind(item.user_id.as_i64())
        .bind(item.book_id.map(BookId::as_i64))
        .bind(item.indexer_id.as_i64())
        .bind(&item.title)
        .bind(&item.author)
        .bind(&item.url)
        .bind(&item.format)
        .bind(item.size_bytes.map(|n| n as i64))
        .bind(item.priority as i64)
        .bind(item.max_retries as i64)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(QueueItemId(result.last_insert_rowid()))
    }

    pub async fn get(&self, id: QueueItemId) -> Result<Option<DownloadItem>> {
        let row = sqlx::query(&format!("{ITEM_SELECT} WHERE id = ?"))
            .bind(id.as_i64())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(map_item_row).transpose()
    }

    /// Pending items in dispatch order: priority first, never-retried
    /// before retried, oldest first.
    pub async fn fetch_pending(&self, limit: usize) -> Result<Vec<DownloadItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "{ITEM_SELECT} WHERE status = 'pending' \
             ORDER BY priority ASC, (retry_count > 0) ASC, created_at ASC \
             LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_item_row).collect()
    }

    /// Failed items that still have retries left. Cooldown eligibility is
    /// decided by the caller, which knows the classified failure reason.
    pub async fn fetch_retry_candidates(&self) -> Result<Vec<DownloadItem>> {
        let rows = sqlx::query(&format!(
            "{ITEM_SELECT} WHERE status = 'failed' AND retry_count < max_retries \
             ORDER BY priority ASC, updated_at ASC"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_item_row).collect()
    }

    /// Compare-and-set `pending` to `downloading`. Returns false when the
    /// row was concurrently taken, so at most one task ever starts per id.
    pub async fn try_start(&self, id: QueueItemId) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE download_queue \
             SET status = 'downloading', started_at = ?, updated_at = ?, \
                 error_message = NULL \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(now)
        .bind(id.as_i64())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move a failed item straight back to `pending` for a retry attempt.
    pub async fn mark_retrying(&self, id: QueueItemId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE download_queue SET status = 'pending', updated_at = ? \
             WHERE id = ? AND status = 'failed' AND retry_count < max_retries",
        )
        .bind(Utc::now())
        .bind(id.as_i64())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_progress(&self, id: QueueItemId, progress_pct: u8) -> Result<()> {
        sqlx::query(
            "UPDATE download_queue SET progress_pct = ?, updated_at = ? WHERE id = ?",
        )
        .bind(progress_pct.min(100) as i64)
        .bind(Utc::now())
        .bind(id.as_i64())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Finalize a successful download in one transaction: flip the row to
    /// `completed`, append the history entry, and roll up daily stats.
    pub async fn mark_completed(
        &self,
        id: QueueItemId,
        local_path: &str,
        file_size_bytes: Option<u64>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            "SELECT user_id, book_id, indexer_id, title, started_at \
             FROM download_queue WHERE id = ?",
        )
        .bind(id.as_i64())
        .fetch_one(&mut *tx)
        .await?;
        let user_id: i64 = row.try_get("user_id")?;
        let book_id: Option<i64> = row.try_get("book_id")?;
        let indexer_id: i64 = row.try_get("indexer_id")?;
        let title: String = row.try_get("title")?;
        let started_at: Option<DateTime<Utc>> = row.try_get("started_at")?;
        let duration_seconds =
            started_at.map(|started| (now - started).num_seconds().max(0));

        sqlx::query(
            "UPDATE download_queue \
             SET status = 'completed', progress_pct = 100, local_path = ?, \
                 completed_at = ?, updated_at = ?, error_message = NULL \
             WHERE id = ?",
        )
        .bind(local_path)
        .bind(now)
        .bind(now)
        .bind(id.as_i64())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO download_history (
                queue_id, user_id, book_id, indexer_id, title, final_status,
                file_size_bytes, download_duration_seconds, completed_at
            )
            VALUES (?, ?, ?, ?, ?, 'completed', ?, ?, ?)
            "#,
        )
        .bind(id.as_i64())
        .bind(user_id)
        .bind(book_id)
        .bind(indexer_id)
        .bind(&title)
        .bind(file_size_bytes.map(|n| n as i64))
        .bind(duration_seconds)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        upsert_stats(&mut tx, now, indexer_id, 1, 0, file_size_bytes.unwrap_or(0))
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record a failure: classify-side bookkeeping lives with the caller;
    /// here the row flips to `failed` and, when allowed, the retry counter
    /// advances. Daily stats roll up in the same transaction.
    pub async fn mark_failed(
        &self,
        id: QueueItemId,
        error_message: &str,
        increment_retry: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query("SELECT indexer_id FROM download_queue WHERE id = ?")
            .bind(id.as_i64())
            .fetch_one(&mut *tx)
            .await?;
        let indexer_id: i64 = row.try_get("indexer_id")?;

        let sql = if increment_retry {
            "UPDATE download_queue \
             SET status = 'failed', error_message = ?, updated_at = ?, \
                 retry_count = MIN(retry_count + 1, max_retries) \
             WHERE id = ?"
        } else {
            "UPDATE download_queue \
             SET status = 'failed', error_message = ?, updated_at = ? \
             WHERE id = ?"
        };
        sqlx::query(sql)
            .bind(error_message)
            .bind(now)
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await?;

        upsert_stats(&mut tx, now, indexer_id, 0, 1, 0).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Reset stalled `downloading` rows back to `pending`, leaving
    /// `retry_count` untouched. Returns the ids that were reset.
    pub async fn reset_stale(&self, stale_after: Duration) -> Result<Vec<QueueItemId>> {
        let cutoff = Utc::now() - stale_after;
        let rows = sqlx::query(
            "UPDATE download_queue \
             SET status = 'pending', progress_pct = 0, updated_at = ? \
             WHERE status = 'downloading' AND updated_at < ? \
             RETURNING id",
        )
        .bind(Utc::now())
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(QueueItemId(row.try_get("id")?));
        }
        if !ids.is_empty() {
            debug!(count = ids.len(), "reset stale downloads to pending");
        }
        Ok(ids)
    }

    /// Return an interrupted item to `pending` (shutdown path).
    pub async fn requeue(&self, id: QueueItemId) -> Result<()> {
        sqlx::query(
            "UPDATE download_queue \
             SET status = 'pending', progress_pct = 0, updated_at = ? \
             WHERE id = ? AND status = 'downloading'",
        )
        .bind(Utc::now())
        .bind(id.as_i64())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Failed attempts per indexer over the trailing window, for the
    /// smart-retry filter.
    pub async fn indexer_failure_counts(
        &self,
        window: Duration,
    ) -> Result<HashMap<i64, u64>> {
        let cutoff = Utc::now() - window;
        let rows = sqlx::query(
            "SELECT indexer_id, COUNT(*) AS failures FROM download_queue \
             WHERE status = 'failed' AND updated_at >= ? \
             GROUP BY indexer_id",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        let mut counts = HashMap::with_capacity(rows.len());
        for row in rows {
            counts.insert(
                row.try_get::<i64, _>("indexer_id")?,
                row.try_get::<i64, _>("failures")? as u64,
            );
        }
        Ok(counts)
    }

    /// Periodic priority rebalancing: age pending items toward urgency,
    /// push repeat offenders up, and under load prefer small payloads.
    pub async fn optimize_priorities(&self, under_load: bool) -> Result<u64> {
        let now = Utc::now();
        let age_cutoff = now - Duration::hours(2);
        let mut affected = 0;

        let aged = sqlx::query(
            "UPDATE download_queue SET priority = MAX(1, priority - 1), updated_at = ? \
             WHERE status = 'pending' AND created_at < ? AND priority > 1",
        )
        .bind(now)
        .bind(age_cutoff)
        .execute(self.pool())
        .await?;
        affected += aged.rows_affected();

        let retried = sqlx::query(
            "UPDATE download_queue SET priority = MIN(10, priority + 1), updated_at = ? \
             WHERE status = 'pending' AND retry_count >= 2 AND priority < 10",
        )
        .bind(now)
        .execute(self.pool())
        .await?;
        affected += retried.rows_affected();

        if under_load {
            let small = sqlx::query(
                "UPDATE download_queue SET priority = MAX(1, priority - 1), updated_at = ? \
                 WHERE status = 'pending' AND size_bytes IS NOT NULL \
                   AND size_bytes < ? AND priority > 1",
            )
            .bind(now)
            .bind(10 * 1024 * 1024_i64)
            .execute(self.pool())
            .await?;
            affected += small.rows_affected();
        }
        Ok(affected)
    }

    /// Aggregate queue snapshot for monitoring consumers.
    pub async fn stats(&self) -> Result<QueueStats> {
        let now = Utc::now();
        let hour_ago = now - Duration::hours(1);

        let mut counts_by_status = HashMap::new();
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM download_queue GROUP BY status",
        )
        .fetch_all(self.pool())
        .await?;
        for row in rows {
            counts_by_status.insert(
                row.try_get::<String, _>("status")?,
                row.try_get::<i64, _>("n")? as u64,
            );
        }

        let wait_row = sqlx::query(
            "SELECT AVG(strftime('%s', 'now') - strftime('%s', created_at)) AS avg_wait \
             FROM download_queue WHERE status = 'pending'",
        )
        .fetch_one(self.pool())
        .await?;
        let avg_wait_seconds: Option<f64> = wait_row.try_get("avg_wait")?;

        let completed_row = sqlx::query(
            "SELECT COUNT(*) AS n FROM download_history \
             WHERE final_status = 'completed' AND completed_at >= ?",
        )
        .bind(hour_ago)
        .fetch_one(self.pool())
        .await?;
        let failed_row = sqlx::query(
            "SELECT COUNT(*) AS n FROM download_queue \
             WHERE status = 'failed' AND updated_at >= ?",
        )
        .bind(hour_ago)
        .fetch_one(self.pool())
        .await?;

        Ok(QueueStats {
            counts_by_status,
            avg_wait_seconds,
            completed_last_hour: completed_row.try_get::<i64, _>("n")? as u64,
            failed_last_hour: failed_row.try_get::<i64, _>("n")? as u64,
            failures_by_indexer: self
                .indexer_failure_counts(Duration::hours(1))
                .await?,
        })
    }
}

async fn upsert_stats(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    now: DateTime<Utc>,
    indexer_id: i64,
    completed: i64,
    failed: i64,
    bytes: u64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO download_stats (day, indexer_id, completed, failed, bytes_downloaded)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (day, indexer_id) DO UPDATE SET
            completed = completed + excluded.completed,
            failed = failed + excluded.failed,
            bytes_downloaded = bytes_downloaded + excluded.bytes_downloaded
        "#,
    )
    .bind(now.format("%Y-%m-%d").to_string())
    .bind(indexer_id)
    .bind(completed)
    .bind(failed)
    .bind(bytes as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

const ITEM_SELECT: &str = r#"
    SELECT id, user_id, book_id, indexer_id, title, author, url, format,
           size_bytes, priority, status, progress_pct, local_path,
           retry_count, max_retries, error_message, started_at,
           completed_at, created_at, updated_at
    FROM download_queue
"#;

fn map_item_row(row: &SqliteRow) -> Result<DownloadItem> {
    let status_text: String = row.try_get("status")?;
    Ok(DownloadItem {
        id: QueueItemId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        book_id: row.try_get::<Option<i64>, _>("book_id")?.map(BookId),
        indexer_id: IndexerId(row.try_get("indexer_id")?),
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        url: row.try_get("url")?,
        format: row.try_get("format")?,
        size_bytes: row
            .try_get::<Option<i64>, _>("size_bytes")?
            .map(|n| n as u64),
        priority: row.try_get::<i64, _>("priority")? as u8,
        status: DownloadStatus::parse(&status_text)?,
        progress_pct: row.try_get::<i64, _>("progress_pct")? as u8,
        local_path: row.try_get("local_path")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        max_retries: row.try_get::<i64, _>("max_retries")? as u32,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
