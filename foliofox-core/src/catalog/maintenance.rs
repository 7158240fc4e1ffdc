use chrono::{Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use foliofox_model::{MaintenanceTask, TaskKind, TaskStatus};

use crate::error::Result;

/// Typed access to `maintenance_tasks`.
#[derive(Clone, Debug)]
pub struct MaintenanceRepository {
    pool: SqlitePool,
}

impl MaintenanceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn record(&self, task: &MaintenanceTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO maintenance_tasks (
                task_id, kind, target_table, status, started_at, ended_at,
                duration_s, rows_affected, space_freed_bytes, error, details,
                created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (task_id) DO UPDATE SET
                status = excluded.status,
                ended_at = excluded.ended_at,
                duration_s = excluded.duration_s,
                rows_affected = excluded.rows_affected,
                space_freed_bytes = excluded.space_freed_bytes,
                error = excluded.error,
                details = excluded.details
            "#,
        )
        .bind(task.task_id.to_string())
        .bind(task.kind.as_str())
        .bind(&task.table)
        .bind(task.status.as_str())
        .bind(task.started_at)
        .bind(task.ended_at)
        .bind(task.duration_s)
        .bind(task.rows_affected.map(|n| n as i64))
        .bind(task.space_freed_bytes.map(|n| n as i64))
        .bind(&task.error)
        .bind(task.details.to_string())
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<MaintenanceTask>> {
        let rows = sqlx::query(
            "SELECT task_id, kind, target_table, status, started_at, ended_at, \
                    duration_s, rows_affected, space_freed_bytes, error, details \
             FROM maintenance_tasks ORDER BY started_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_task_row).collect()
    }

    /// Delete completed task rows older than the retention horizon.
    pub async fn prune(&self, retain: Duration) -> Result<u64> {
        let cutoff = Utc::now() - retain;
        let result = sqlx::query(
            "DELETE FROM maintenance_tasks \
             WHERE started_at < ? AND status = 'completed'",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

fn map_task_row(row: &SqliteRow) -> Result<MaintenanceTask> {
    let task_id_text: String = row.try_get("task_id")?;
    let kind_text: String = row.try_get("kind")?;
    let status_text: String = row.try_get("status")?;
    let details_text: Option<String> = row.try_get("details")?;
    Ok(MaintenanceTask {
        task_id: uuid::Uuid::parse_str(&task_id_text)
            .map_err(|e| crate::error::FolioError::Internal(e.to_string()))?,
        kind: TaskKind::parse(&kind_text)?,
        table: row.try_get("target_table")?,
        status: TaskStatus::parse(&status_text)?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        duration_s: row.try_get("duration_s")?,
        rows_affected: row
            .try_get::<Option<i64>, _>("rows_affected")?
            .map(|n| n as u64),
        space_freed_bytes: row
            .try_get::<Option<i64>, _>("space_freed_bytes")?
            .map(|n| n as u64),
        error: row.try_get("error")?,
        details: details_text
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or(serde_json::Value::Null),
    })
}
