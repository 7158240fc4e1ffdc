//! Catalog backup with optional compression and verification.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Row};
use tracing::{info, warn};

use foliofox_config::BackupConfig;
use foliofox_model::TaskStatus;

use crate::catalog::CatalogStore;
use crate::error::{FolioError, Result};
use crate::maintenance::TaskExecution;

static BACKUP_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^foliofox_backup_(\d{8}_\d{6})\.db(?:\.gz)?$").expect("backup regex")
});

/// Streams consistent catalog copies into the backup directory and culls
/// old ones by their filename timestamp.
#[derive(Clone, Debug)]
pub struct BackupManager {
    store: CatalogStore,
    config: BackupConfig,
}

impl BackupManager {
    pub fn new(store: CatalogStore, config: BackupConfig) -> Self {
        Self { store, config }
    }

    /// Take one backup: consistent copy, optional verification of the
    /// copy, optional gzip (atomic rename, uncompressed removed), then
    /// retention cull.
    pub async fn run(&self) -> Result<TaskExecution> {
        tokio::fs::create_dir_all(&self.config.backup_dir).await?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let plain_path = self
            .config
            .backup_dir
            .join(format!("foliofox_backup_{stamp}.db"));

        // VACUUM INTO writes a consistent, defragmented copy without
        // blocking readers.
        sqlx::query("VACUUM INTO ?")
            .bind(plain_path.to_string_lossy().as_ref())
            .execute(self.store.pool())
            .await?;

        let verified = if self.config.enable_verification {
            self.verify_copy(&plain_path).await?;
            true
        } else {
            false
        };

        let final_path = if self.config.enable_compression {
            let compressed = compress_backup(&plain_path).await?;
            tokio::fs::remove_file(&plain_path).await?;
            compressed
        } else {
            plain_path
        };
        let size_bytes = tokio::fs::metadata(&final_path).await?.len();
        let culled = self.cull_old_backups().await?;

        info!(path = %final_path.display(), size_bytes, verified, "backup written");
        Ok(TaskExecution {
            status: TaskStatus::Completed,
            rows_affected: None,
            space_freed_bytes: None,
            error: None,
            details: json!({
                "path": final_path.to_string_lossy(),
                "size_bytes": size_bytes,
                "compressed": self.config.enable_compression,
                "verified": verified,
                "old_backups_removed": culled,
            }),
        })
    }

    /// Open the copy read-only and require `PRAGMA quick_check` = ok.
    async fn verify_copy(&self, path: &Path) -> Result<()> {
        let mut conn = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .connect()
            .await?;
        let row = sqlx::query("PRAGMA quick_check")
            .fetch_one(&mut conn)
            .await?;
        let verdict: String = row.try_get(0)?;
        if verdict != "ok" {
            return Err(FolioError::IntegrityCheckFailed(format!(
                "backup {} failed verification: {verdict}",
                path.display()
            )));
        }
        Ok(())
    }

    /// Delete backups older than the retention horizon. Files whose names
    /// do not parse are left alone.
    pub async fn cull_old_backups(&self) -> Result<u64> {
        let horizon = Utc::now() - Duration::days(self.config.retention_days);
        let mut removed = 0;

        let mut entries = tokio::fs::read_dir(&self.config.backup_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stamp) = parse_backup_timestamp(name) else {
                continue;
            };
            if stamp < horizon.naive_utc() {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(err) => {
                        warn!(file = name, %err, "failed to remove expired backup");
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// Timestamp encoded in a backup filename, or `None` when it is not one
/// of ours.
fn parse_backup_timestamp(filename: &str) -> Option<NaiveDateTime> {
    let captures = BACKUP_NAME.captures(filename)?;
    NaiveDateTime::parse_from_str(&captures[1], "%Y%m%d_%H%M%S").ok()
}

/// Gzip `path` next to itself, writing through a temp name and renaming
/// atomically once the stream is flushed.
async fn compress_backup(path: &Path) -> Result<PathBuf> {
    let source = path.to_path_buf();
    let target = PathBuf::from(format!("{}.gz", path.display()));
    let staging = PathBuf::from(format!("{}.gz.partial", path.display()));

    let (source_blocking, staging_blocking) = (source.clone(), staging.clone());
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut reader = BufReader::new(File::open(&source_blocking)?);
        let writer = BufWriter::new(File::create(&staging_blocking)?);
        let mut encoder = GzEncoder::new(writer, Compression::default());
        std::io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?.into_inner().map_err(|e| e.into_error())?;
        Ok(())
    })
    .await
    .map_err(|e| FolioError::Internal(format!("compression task panicked: {e}")))??;

    tokio::fs::rename(&staging, &target).await?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backup_timestamp() {
        let stamp = parse_backup_timestamp("foliofox_backup_20260801_120000.db");
        assert!(stamp.is_some());
        let stamp = parse_backup_timestamp("foliofox_backup_20260801_120000.db.gz");
        assert!(stamp.is_some());
        assert!(parse_backup_timestamp("foliofox_backup_garbage.db").is_none());
        assert!(parse_backup_timestamp("notes.txt").is_none());
    }
}
