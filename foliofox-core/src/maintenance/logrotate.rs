//! Application log-file rotation with compression.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, SystemTime};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use tracing::{debug, info};

use foliofox_config::MaintenanceConfig;
use foliofox_model::TaskStatus;

use crate::error::{FolioError, Result};
use crate::maintenance::TaskExecution;

/// Rotate oversized `.log` files into timestamped gzip archives and prune
/// archives past retention. Purely filesystem work, so it runs on the
/// blocking pool.
pub async fn rotate_logs(config: &MaintenanceConfig) -> Result<TaskExecution> {
    let log_dir = config.log_dir.clone();
    let max_size_bytes = config.log_max_size_mb * 1024 * 1024;
    let retention = StdDuration::from_secs(
        (config.log_retention_days.max(0) as u64) * 24 * 60 * 60,
    );

    let outcome = tokio::task::spawn_blocking(move || {
        rotate_blocking(&log_dir, max_size_bytes, retention)
    })
    .await
    .map_err(|e| FolioError::Internal(format!("log rotation task panicked: {e}")))??;

    info!(
        rotated = outcome.rotated,
        pruned = outcome.pruned,
        "log rotation finished"
    );
    Ok(TaskExecution {
        status: TaskStatus::Completed,
        rows_affected: None,
        space_freed_bytes: Some(outcome.bytes_reclaimed),
        error: None,
        details: json!({
            "rotated": outcome.rotated,
            "archives_pruned": outcome.pruned,
        }),
    })
}

#[derive(Debug, Default)]
struct RotationOutcome {
    rotated: u64,
    pruned: u64,
    bytes_reclaimed: u64,
}

fn rotate_blocking(
    log_dir: &Path,
    max_size_bytes: u64,
    retention: StdDuration,
) -> Result<RotationOutcome> {
    let mut outcome = RotationOutcome::default();
    if !log_dir.exists() {
        return Ok(outcome);
    }

    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let metadata = entry.metadata()?;

        match extension {
            "log" if metadata.len() > max_size_bytes => {
                let archived = archive_path(&path);
                compress_file(&path, &archived)?;
                let compressed_size =
                    std::fs::metadata(&archived).map(|m| m.len()).unwrap_or(0);
                std::fs::remove_file(&path)?;
                outcome.rotated += 1;
                outcome.bytes_reclaimed +=
                    metadata.len().saturating_sub(compressed_size);
                debug!(file = %path.display(), "rotated log file");
            }
            "gz" => {
                let expired = metadata
                    .modified()
                    .ok()
                    .and_then(|at| SystemTime::now().duration_since(at).ok())
                    .is_some_and(|age| age > retention);
                if expired {
                    outcome.bytes_reclaimed += metadata.len();
                    std::fs::remove_file(&path)?;
                    outcome.pruned += 1;
                }
            }
            _ => {}
        }
    }
    Ok(outcome)
}

fn archive_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("log");
    path.with_file_name(format!("{stem}.{stamp}.log.gz"))
}

fn compress_file(source: &Path, target: &Path) -> Result<()> {
    let mut reader = BufReader::new(File::open(source)?);
    let writer = BufWriter::new(File::create(target)?);
    let mut encoder = GzEncoder::new(writer, Compression::default());
    std::io::copy(&mut reader, &mut encoder)?;
    encoder
        .finish()?
        .into_inner()
        .map_err(|e| FolioError::Io(e.into_error()))?;
    Ok(())
}
