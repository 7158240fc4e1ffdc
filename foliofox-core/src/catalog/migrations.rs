//! Numbered, embedded schema migrations.
//!
//! Each migration applies in one transaction and records
//! `{version, filename, checksum, applied_at}` in `schema_versions`.
//! Startup re-checksums every applied file and refuses to proceed on
//! drift. Rollback is version-record-only; data-preserving rollback is
//! out of scope.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::error::{FolioError, Result};

/// One embedded migration.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub filename: &'static str,
    pub sql: &'static str,
}

/// All migrations, ascending. New migrations append; existing entries are
/// immutable once shipped.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        filename: "0001_catalog.sql",
        sql: include_str!("../../migrations/0001_catalog.sql"),
    },
    Migration {
        version: 2,
        filename: "0002_acquisition.sql",
        sql: include_str!("../../migrations/0002_acquisition.sql"),
    },
    Migration {
        version: 3,
        filename: "0003_operations.sql",
        sql: include_str!("../../migrations/0003_operations.sql"),
    },
];

fn checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hex_string(&hasher.finalize())
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

async fn ensure_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            filename TEXT NOT NULL,
            checksum TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Highest applied migration version, if any.
pub async fn current_version(pool: &SqlitePool) -> Result<Option<i64>> {
    ensure_version_table(pool).await?;
    let row = sqlx::query("SELECT MAX(version) AS version FROM schema_versions")
        .fetch_one(pool)
        .await?;
    Ok(row.try_get::<Option<i64>, _>("version")?)
}

/// Apply every migration newer than the recorded version, one transaction
/// per migration.
pub async fn apply_pending(pool: &SqlitePool) -> Result<()> {
    ensure_version_table(pool).await?;
    let applied = current_version(pool).await?.unwrap_or(0);

    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        let mut tx = pool.begin().await?;
        // SQLite's prepared statements hold a single statement; migrations
        // carry many, so split on the terminator.
        for statement in split_statements(migration.sql) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        sqlx::query(
            "INSERT INTO schema_versions (version, filename, checksum, applied_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(migration.version)
        .bind(migration.filename)
        .bind(checksum(migration.sql))
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(version = migration.version, file = migration.filename, "applied migration");
    }
    Ok(())
}

/// Re-checksum every applied migration against the embedded source and
/// fail on any drift.
pub async fn verify_applied(pool: &SqlitePool) -> Result<()> {
    ensure_version_table(pool).await?;
    let rows = sqlx::query("SELECT version, checksum FROM schema_versions ORDER BY version")
        .fetch_all(pool)
        .await?;

    for row in rows {
        let version: i64 = row.try_get("version")?;
        let recorded: String = row.try_get("checksum")?;
        let Some(migration) = MIGRATIONS.iter().find(|m| m.version == version) else {
            return Err(FolioError::SchemaMismatch {
                version,
                recorded,
                computed: "<missing from build>".to_string(),
            });
        };
        let computed = checksum(migration.sql);
        if computed != recorded {
            return Err(FolioError::SchemaMismatch {
                version,
                recorded,
                computed,
            });
        }
    }
    Ok(())
}

/// Remove the version record without touching data. The caller is expected
/// to reconcile the schema out of band.
pub async fn rollback_record(pool: &SqlitePool, version: i64) -> Result<()> {
    let result = sqlx::query("DELETE FROM schema_versions WHERE version = ?")
        .bind(version)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(FolioError::NotFound(format!(
            "schema version {version} is not recorded"
        )));
    }
    warn!(version, "rolled back migration record (data preserved)");
    Ok(())
}

/// Split a migration file into individual statements. Good enough for our
/// own migration files: no semicolons inside string literals or triggers.
fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| {
            !s.is_empty()
                && !s
                    .lines()
                    .all(|line| line.trim().is_empty() || line.trim_start().starts_with("--"))
        })
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_strictly_ascending() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn test_split_statements_skips_comment_only_chunks() {
        let parts = split_statements(
            "-- header\nCREATE TABLE a (id INTEGER);\n\n-- trailing comment\n",
        );
        assert_eq!(parts.len(), 1);
        assert!(parts[0].contains("CREATE TABLE a"));
    }

    #[test]
    fn test_checksum_is_stable_hex() {
        let sum = checksum("SELECT 1");
        assert_eq!(sum.len(), 64);
        assert_eq!(sum, checksum("SELECT 1"));
        assert_ne!(sum, checksum("SELECT 2"));
    }
}
