//! One download from HTTP GET to final file, with a scoped temp file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use foliofox_model::DownloadItem;

use crate::catalog::QueueRepository;
use crate::queue::bandwidth::BandwidthLimiter;

/// Settings one transfer runs under.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub download_dir: PathBuf,
    pub chunk_size: usize,
    pub timeout: Duration,
}

/// Successful transfer result.
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub local_path: PathBuf,
    pub bytes_written: u64,
}

/// Transfer failure carrying the message the classifier reads.
#[derive(Debug)]
pub enum TransferError {
    /// Remote or local failure; message feeds failure classification.
    Failed(String),
    /// Shut down or stale-cancelled mid-stream.
    Cancelled,
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Failed(message) => f.write_str(message),
            TransferError::Cancelled => f.write_str("transfer cancelled"),
        }
    }
}

/// Removes the temp file on every exit path unless disarmed.
#[derive(Debug)]
struct TempFileGuard {
    path: Option<PathBuf>,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn path(&self) -> &Path {
        self.path.as_deref().expect("armed temp guard")
    }

    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take()
            && let Err(err) = std::fs::remove_file(&path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), %err, "failed to remove temp file");
        }
    }
}

/// Strip filesystem-hostile characters and cap the length.
pub fn sanitize_title(title: &str) -> String {
    const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let cleaned: String = title
        .chars()
        .filter(|c| !FORBIDDEN.contains(c) && !c.is_control())
        .collect();
    let trimmed = cleaned.trim();
    let mut out = String::with_capacity(trimmed.len().min(200));
    for ch in trimmed.chars() {
        if out.chars().count() >= 200 {
            break;
        }
        out.push(ch);
    }
    if out.is_empty() { "untitled".to_string() } else { out }
}

fn temp_path(dir: &Path, item: &DownloadItem) -> PathBuf {
    let epoch = chrono::Utc::now().timestamp();
    dir.join(format!("temp_{}_{}.{}", item.id, epoch, item.format))
}

fn final_path(dir: &Path, item: &DownloadItem) -> PathBuf {
    dir.join(format!("{}.{}", sanitize_title(&item.title), item.format))
}

/// Stream one item to disk. Progress heartbeats go through the queue
/// repository so staleness detection sees live transfers.
pub async fn run(
    client: &reqwest::Client,
    item: &DownloadItem,
    settings: &TransferSettings,
    bandwidth: &BandwidthLimiter,
    queue: &QueueRepository,
    cancel: &CancellationToken,
) -> Result<CompletedTransfer, TransferError> {
    tokio::fs::create_dir_all(&settings.download_dir)
        .await
        .map_err(|e| TransferError::Failed(format!("create download dir: {e}")))?;

    let mut guard = TempFileGuard::new(temp_path(&settings.download_dir, item));

    let response = tokio::select! {
        () = cancel.cancelled() => return Err(TransferError::Cancelled),
        response = client
            .get(&item.url)
            .timeout(settings.timeout)
            .send() => response.map_err(|e| TransferError::Failed(e.to_string()))?,
    };
    if response.status() != reqwest::StatusCode::OK {
        return Err(TransferError::Failed(format!(
            "HTTP {} from {}",
            response.status(),
            item.url
        )));
    }
    let declared_length = response.content_length();

    let mut file = tokio::fs::File::create(guard.path())
        .await
        .map_err(|e| TransferError::Failed(format!("create temp file: {e}")))?;

    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    let mut reported_pct: u8 = 0;

    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => return Err(TransferError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk.map_err(|e| TransferError::Failed(e.to_string()))?;

        for piece in chunk.chunks(settings.chunk_size.max(1)) {
            bandwidth.acquire(piece.len()).await;
            file.write_all(piece)
                .await
                .map_err(|e| TransferError::Failed(format!("write temp file: {e}")))?;
            written += piece.len() as u64;
        }

        if let Some(total) = declared_length
            && total > 0
        {
            let pct = ((written * 100) / total).min(100) as u8;
            if pct > reported_pct {
                reported_pct = pct;
                queue
                    .update_progress(item.id, pct)
                    .await
                    .map_err(|e| TransferError::Failed(format!("progress update: {e}")))?;
            }
        }
    }

    file.flush()
        .await
        .map_err(|e| TransferError::Failed(format!("flush temp file: {e}")))?;
    drop(file);

    // A declared length we failed to reach means a truncated or padded
    // stream; without one, end-of-stream is taken as success.
    if let Some(total) = declared_length
        && written != total
    {
        return Err(TransferError::Failed(format!(
            "size mismatch: downloaded {written} of declared {total} bytes"
        )));
    }

    let destination = final_path(&settings.download_dir, item);
    tokio::fs::rename(guard.path(), &destination)
        .await
        .map_err(|e| TransferError::Failed(format!("finalize file: {e}")))?;
    guard.disarm();

    debug!(item = %item.id, path = %destination.display(), written, "transfer complete");
    Ok(CompletedTransfer {
        local_path: destination,
        bytes_written: written,
    })
}
