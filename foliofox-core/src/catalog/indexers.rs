use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use foliofox_model::{Indexer, IndexerId, IndexerType};

use crate::error::{FolioError, Result};

/// Typed access to the `indexers` table.
#[derive(Clone, Debug)]
pub struct IndexerRepository {
    pool: SqlitePool,
}

impl IndexerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create(&self, indexer: &Indexer) -> Result<IndexerId> {
        indexer.validate()?;
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO indexers (
                name, indexer_type, base_url, api_key, priority, active,
                timeout_ms, rate_limit_per_window, window_ms,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&indexer.name)
        .bind(indexer.indexer_type.as_str())
        .bind(&indexer.base_url)
        .bind(&indexer.api_key)
        .bind(indexer.priority as i64)
        .bind(indexer.active)
        .bind(indexer.timeout_ms as i64)
        .bind(indexer.rate_limit_per_window as i64)
        .bind(indexer.window_ms as i64)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(IndexerId(result.last_insert_rowid()))
    }

    pub async fn get(&self, id: IndexerId) -> Result<Option<Indexer>> {
        let row = sqlx::query(&format!("{INDEXER_SELECT} WHERE id = ?"))
            .bind(id.as_i64())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(map_indexer_row).transpose()
    }

    /// Active indexers, most preferred first.
    pub async fn list_active(&self) -> Result<Vec<Indexer>> {
        let rows = sqlx::query(&format!(
            "{INDEXER_SELECT} WHERE active = 1 ORDER BY priority, id"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_indexer_row).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<Indexer>> {
        let rows = sqlx::query(&format!("{INDEXER_SELECT} ORDER BY priority, id"))
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(map_indexer_row).collect()
    }

    pub async fn set_active(&self, id: IndexerId, active: bool) -> Result<()> {
        sqlx::query("UPDATE indexers SET active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(Utc::now())
            .bind(id.as_i64())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete an indexer. Refused while any queue row references it; the
    /// foreign key reports that as a database error we surface verbatim.
    pub async fn delete(&self, id: IndexerId) -> Result<()> {
        let referenced = sqlx::query(
            "SELECT 1 AS present FROM download_queue WHERE indexer_id = ? LIMIT 1",
        )
        .bind(id.as_i64())
        .fetch_optional(self.pool())
        .await?;
        if referenced.is_some() {
            return Err(FolioError::Config(format!(
                "indexer {id} still referenced by download_queue rows"
            )));
        }
        sqlx::query("DELETE FROM indexers WHERE id = ?")
            .bind(id.as_i64())
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

const INDEXER_SELECT: &str = r#"
    SELECT id, name, indexer_type, base_url, api_key, priority, active,
           timeout_ms, rate_limit_per_window, window_ms
    FROM indexers
"#;

fn map_indexer_row(row: &SqliteRow) -> Result<Indexer> {
    let type_text: String = row.try_get("indexer_type")?;
    Ok(Indexer {
        id: IndexerId(row.try_get("id")?),
        name: row.try_get("name")?,
        indexer_type: IndexerType::parse(&type_text)?,
        base_url: row.try_get("base_url")?,
        api_key: row.try_get("api_key")?,
        priority: row.try_get::<i64, _>("priority")? as u8,
        active: row.try_get("active")?,
        timeout_ms: row.try_get::<i64, _>("timeout_ms")? as u64,
        rate_limit_per_window: row.try_get::<i64, _>("rate_limit_per_window")? as u32,
        window_ms: row.try_get::<i64, _>("window_ms")? as u64,
    })
}
