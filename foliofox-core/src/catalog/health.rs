use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use foliofox_model::{HealthSample, HealthStatus, IndexerId};

use crate::error::Result;

/// Typed access to the append-only `indexer_health` table.
#[derive(Clone, Debug)]
pub struct HealthRepository {
    pool: SqlitePool,
}

impl HealthRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn append(&self, sample: &HealthSample) -> Result<()> {
        sqlx::query(
            "INSERT INTO indexer_health (indexer_id, status, response_time_ms, error, checked_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(sample.indexer_id.as_i64())
        .bind(sample.status.as_str())
        .bind(sample.response_time_ms.map(|n| n as i64))
        .bind(&sample.error)
        .bind(sample.checked_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Latest sample for one indexer, if any exist.
    pub async fn latest(&self, indexer_id: IndexerId) -> Result<Option<HealthSample>> {
        let row = sqlx::query(&format!(
            "{SAMPLE_SELECT} WHERE indexer_id = ? ORDER BY checked_at DESC LIMIT 1"
        ))
        .bind(indexer_id.as_i64())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(map_sample_row).transpose()
    }

    /// Samples for one indexer newer than `since`, newest first.
    pub async fn since(
        &self,
        indexer_id: IndexerId,
        since: DateTime<Utc>,
    ) -> Result<Vec<HealthSample>> {
        let rows = sqlx::query(&format!(
            "{SAMPLE_SELECT} WHERE indexer_id = ? AND checked_at >= ? \
             ORDER BY checked_at DESC"
        ))
        .bind(indexer_id.as_i64())
        .bind(since)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_sample_row).collect()
    }

    /// Fraction of passing probes over the trailing 24 hours, or `None`
    /// when no samples exist. `down` and `degraded` both count as failures
    /// here; the classifier cares about probe outcomes, not labels.
    pub async fn success_rate_24h(&self, indexer_id: IndexerId) -> Result<Option<f64>> {
        let cutoff = Utc::now() - Duration::hours(24);
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    SUM(CASE WHEN status IN ('healthy', 'recovering') THEN 1 ELSE 0 END) AS passing \
             FROM indexer_health WHERE indexer_id = ? AND checked_at >= ?",
        )
        .bind(indexer_id.as_i64())
        .bind(cutoff)
        .fetch_one(self.pool())
        .await?;
        let total: i64 = row.try_get("total")?;
        if total == 0 {
            return Ok(None);
        }
        let passing: i64 = row.try_get::<Option<i64>, _>("passing")?.unwrap_or(0);
        Ok(Some(passing as f64 / total as f64 * 100.0))
    }

    /// Trailing consecutive failed samples (newest backwards), used to
    /// rebuild breaker state after a restart.
    pub async fn consecutive_failures(&self, indexer_id: IndexerId) -> Result<u32> {
        let rows = sqlx::query(
            "SELECT status FROM indexer_health WHERE indexer_id = ? \
             ORDER BY checked_at DESC LIMIT 100",
        )
        .bind(indexer_id.as_i64())
        .fetch_all(self.pool())
        .await?;
        let mut count = 0;
        for row in rows {
            let status: String = row.try_get("status")?;
            match HealthStatus::parse(&status)? {
                HealthStatus::Down | HealthStatus::Degraded => count += 1,
                _ => break,
            }
        }
        Ok(count)
    }

    /// Delete samples older than `retain`, always keeping the latest row
    /// per indexer. Returns rows removed.
    pub async fn prune(&self, retain: Duration) -> Result<u64> {
        let cutoff = Utc::now() - retain;
        let result = sqlx::query(
            "DELETE FROM indexer_health \
             WHERE checked_at < ? \
               AND id NOT IN ( \
                   SELECT MAX(id) FROM indexer_health GROUP BY indexer_id \
               )",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

const SAMPLE_SELECT: &str = r#"
    SELECT indexer_id, status, response_time_ms, error, checked_at
    FROM indexer_health
"#;

fn map_sample_row(row: &SqliteRow) -> Result<HealthSample> {
    let status_text: String = row.try_get("status")?;
    Ok(HealthSample {
        indexer_id: IndexerId(row.try_get("indexer_id")?),
        status: HealthStatus::parse(&status_text)?,
        response_time_ms: row
            .try_get::<Option<i64>, _>("response_time_ms")?
            .map(|n| n as u64),
        error: row.try_get("error")?,
        checked_at: row.try_get("checked_at")?,
    })
}
