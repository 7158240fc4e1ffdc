//! Individual database maintenance operations. Each is idempotent and
//! individually invocable; the orchestrator sequences them.

use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use foliofox_model::TaskStatus;

use crate::catalog::CatalogStore;
use crate::error::Result;
use crate::maintenance::TaskExecution;

/// Database-facing maintenance primitives over the catalog pool.
#[derive(Clone, Debug)]
pub struct DbMaintenance {
    store: CatalogStore,
}

impl DbMaintenance {
    pub fn new(store: CatalogStore) -> Self {
        Self { store }
    }

    fn pool(&self) -> &SqlitePool {
        self.store.pool()
    }

    /// `PRAGMA quick_check` plus `PRAGMA foreign_key_check`. Violations
    /// mark the run `partial`; destructive tasks must not follow.
    pub async fn integrity_check(&self) -> Result<TaskExecution> {
        let quick_rows = sqlx::query("PRAGMA quick_check")
            .fetch_all(self.pool())
            .await?;
        let mut problems: Vec<String> = Vec::new();
        for row in &quick_rows {
            let line: String = row.try_get(0)?;
            if line != "ok" {
                problems.push(line);
            }
        }

        let fk_rows = sqlx::query("PRAGMA foreign_key_check")
            .fetch_all(self.pool())
            .await?;
        let fk_violations = fk_rows.len();
        for row in &fk_rows {
            let table: String = row.try_get(0)?;
            problems.push(format!("foreign key violation in {table}"));
        }

        let status = if problems.is_empty() {
            TaskStatus::Completed
        } else {
            warn!(count = problems.len(), "integrity check found violations");
            TaskStatus::Partial
        };
        Ok(TaskExecution {
            status,
            rows_affected: None,
            space_freed_bytes: None,
            error: None,
            details: json!({
                "quick_check": if problems.is_empty() { "ok" } else { "violations" },
                "foreign_key_violations": fk_violations,
                "problems": problems,
            }),
        })
    }

    /// Retention cleanup across the operational tables.
    pub async fn cleanup(&self, retention_days: i64) -> Result<TaskExecution> {
        let retention = Duration::days(retention_days);
        let mut removed: u64 = 0;
        let mut breakdown = serde_json::Map::new();

        let logs = self.store.logs().prune(retention).await?;
        removed += logs;
        breakdown.insert("system_logs".to_string(), json!(logs));

        let cache = sqlx::query("DELETE FROM search_cache WHERE expires_at < ?")
            .bind(Utc::now())
            .execute(self.pool())
            .await?
            .rows_affected();
        removed += cache;
        breakdown.insert("search_cache".to_string(), json!(cache));

        let health = self
            .store
            .health()
            .prune(Duration::days(30))
            .await?;
        removed += health;
        breakdown.insert("indexer_health".to_string(), json!(health));

        let history = sqlx::query(
            "DELETE FROM download_history \
             WHERE completed_at < ? AND final_status = 'completed'",
        )
        .bind(Utc::now() - retention)
        .execute(self.pool())
        .await?
        .rows_affected();
        removed += history;
        breakdown.insert("download_history".to_string(), json!(history));

        let tasks = self.store.maintenance().prune(retention).await?;
        removed += tasks;
        breakdown.insert("maintenance_tasks".to_string(), json!(tasks));

        info!(removed, "cleanup removed expired rows");
        Ok(TaskExecution {
            status: TaskStatus::Completed,
            rows_affected: Some(removed),
            space_freed_bytes: None,
            error: None,
            details: serde_json::Value::Object(breakdown),
        })
    }

    /// Refresh query-planner statistics, whole DB or one table.
    pub async fn analyze(&self, table: Option<&str>) -> Result<TaskExecution> {
        let sql = match table {
            Some(table) => format!("ANALYZE {}", quote_identifier(table)),
            None => "ANALYZE".to_string(),
        };
        sqlx::query(&sql).execute(self.pool()).await?;
        Ok(TaskExecution {
            status: TaskStatus::Completed,
            rows_affected: None,
            space_freed_bytes: None,
            error: None,
            details: json!({ "table": table }),
        })
    }

    /// Rebuild indexes, whole DB or one table.
    pub async fn reindex(&self, table: Option<&str>) -> Result<TaskExecution> {
        let sql = match table {
            Some(table) => format!("REINDEX {}", quote_identifier(table)),
            None => "REINDEX".to_string(),
        };
        sqlx::query(&sql).execute(self.pool()).await?;
        Ok(TaskExecution {
            status: TaskStatus::Completed,
            rows_affected: None,
            space_freed_bytes: None,
            error: None,
            details: json!({ "table": table }),
        })
    }

    /// `freelist_pages / page_count · 100`, the vacuum/reindex gate.
    pub async fn fragmentation_percent(&self) -> Result<f64> {
        let page_count: i64 = sqlx::query("PRAGMA page_count")
            .fetch_one(self.pool())
            .await?
            .try_get(0)?;
        let freelist: i64 = sqlx::query("PRAGMA freelist_count")
            .fetch_one(self.pool())
            .await?
            .try_get(0)?;
        if page_count == 0 {
            return Ok(0.0);
        }
        Ok(freelist as f64 / page_count as f64 * 100.0)
    }

    /// Catalog file size on disk; zero for in-memory databases.
    pub fn database_size_bytes(&self) -> u64 {
        std::fs::metadata(self.store.path())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Compact the catalog file. The caller holds the exclusive session
    /// and has already confirmed integrity; the gates live in the
    /// orchestrator so a manual invocation can still force a vacuum.
    pub async fn vacuum(&self) -> Result<TaskExecution> {
        let before = self.database_size_bytes();
        let fragmentation_before = self.fragmentation_percent().await?;

        sqlx::query("VACUUM").execute(self.pool()).await?;

        let after = self.database_size_bytes();
        let freed = before.saturating_sub(after);
        info!(before, after, freed, "vacuum compacted catalog");
        Ok(TaskExecution {
            status: TaskStatus::Completed,
            rows_affected: None,
            space_freed_bytes: Some(freed),
            error: None,
            details: json!({
                "size_before_bytes": before,
                "size_after_bytes": after,
                "fragmentation_before_percent": fragmentation_before,
            }),
        })
    }
}

/// Identifier quoting for the table-scoped variants. Table names come
/// from the fixed schema vocabulary, never user input.
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
