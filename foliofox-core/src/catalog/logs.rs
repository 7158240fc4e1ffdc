use chrono::{Duration, Utc};
use sqlx::SqlitePool;

use crate::error::Result;

/// Severity recorded with a `system_logs` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

/// Typed access to `system_logs`.
#[derive(Clone, Debug)]
pub struct LogRepository {
    pool: SqlitePool,
}

impl LogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        level: LogLevel,
        component: &str,
        message: &str,
        details: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_logs (level, component, message, details, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(level.as_str())
        .bind(component)
        .bind(message)
        .bind(details.map(|d| d.to_string()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete non-error rows older than the retention horizon. ERROR and
    /// CRITICAL entries are kept for operators.
    pub async fn prune(&self, retain: Duration) -> Result<u64> {
        let cutoff = Utc::now() - retain;
        let result = sqlx::query(
            "DELETE FROM system_logs \
             WHERE created_at < ? AND level NOT IN ('ERROR', 'CRITICAL')",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64> {
        use sqlx::Row;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM system_logs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}
