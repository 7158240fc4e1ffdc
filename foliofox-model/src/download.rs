use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::ids::{BookId, IndexerId, QueueItemId, UserId};

/// Lifecycle state of one download queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
            DownloadStatus::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(DownloadStatus::Pending),
            "downloading" => Ok(DownloadStatus::Downloading),
            "completed" => Ok(DownloadStatus::Completed),
            "failed" => Ok(DownloadStatus::Failed),
            "cancelled" => Ok(DownloadStatus::Cancelled),
            "paused" => Ok(DownloadStatus::Paused),
            other => Err(ModelError::UnknownVariant(
                "download status",
                other.to_string(),
            )),
        }
    }

    /// Terminal states never re-enter the scheduler on their own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Cancelled
        )
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `download_queue` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadItem {
    pub id: QueueItemId,
    pub user_id: UserId,
    pub book_id: Option<BookId>,
    pub indexer_id: IndexerId,
    pub title: String,
    pub author: Option<String>,
    pub url: String,
    pub format: String,
    pub size_bytes: Option<u64>,
    /// 1 is the most urgent, 10 the least.
    pub priority: u8,
    pub status: DownloadStatus,
    pub progress_pct: u8,
    pub local_path: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadItem {
    /// Check the invariants the queue engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.retry_count > self.max_retries {
            return Err(ModelError::InvalidField(
                "retry_count",
                format!("{} exceeds max_retries {}", self.retry_count, self.max_retries),
            ));
        }
        if self.progress_pct > 100 {
            return Err(ModelError::InvalidField(
                "progress_pct",
                format!("{} outside [0..100]", self.progress_pct),
            ));
        }
        if self.status == DownloadStatus::Completed {
            if self.progress_pct != 100 {
                return Err(ModelError::InvalidField(
                    "progress_pct",
                    "completed item must be at 100".to_string(),
                ));
            }
            if self.local_path.is_none() || self.completed_at.is_none() {
                return Err(ModelError::InvalidField(
                    "local_path",
                    "completed item must carry a path and completion time".to_string(),
                ));
            }
        }
        if let (Some(started), Some(completed)) = (self.started_at, self.completed_at)
            && started > completed
        {
            return Err(ModelError::InvalidField(
                "started_at",
                "follows completed_at".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }
}

/// One `download_history` row, written when a queue item finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadHistoryEntry {
    pub id: i64,
    pub queue_id: QueueItemId,
    pub user_id: UserId,
    pub book_id: Option<BookId>,
    pub indexer_id: IndexerId,
    pub title: String,
    pub final_status: DownloadStatus,
    pub file_size_bytes: Option<u64>,
    pub download_duration_seconds: Option<i64>,
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Aggregate snapshot over the queue, served to monitoring consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub counts_by_status: HashMap<String, u64>,
    /// Mean seconds a pending item has been waiting.
    pub avg_wait_seconds: Option<f64>,
    /// Completions over the sampling window.
    pub completed_last_hour: u64,
    pub failed_last_hour: u64,
    /// Failure counts per indexer over the last hour, for smart-retry.
    pub failures_by_indexer: HashMap<i64, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DownloadItem {
        let now = Utc::now();
        DownloadItem {
            id: QueueItemId(7),
            user_id: UserId(1),
            book_id: None,
            indexer_id: IndexerId(2),
            title: "Some Book".to_string(),
            author: None,
            url: "https://indexer.example/dl/7".to_string(),
            format: "epub".to_string(),
            size_bytes: Some(1024),
            priority: 5,
            status: DownloadStatus::Pending,
            progress_pct: 0,
            local_path: None,
            retry_count: 0,
            max_retries: 3,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_completed_requires_path_and_timestamp() {
        let mut item = sample();
        item.status = DownloadStatus::Completed;
        item.progress_pct = 100;
        assert!(item.validate().is_err());

        item.local_path = Some("/books/some_book.epub".to_string());
        item.completed_at = Some(Utc::now());
        assert!(item.validate().is_ok());
    }

    #[test]
    fn test_retry_count_capped_by_max_retries() {
        let mut item = sample();
        item.retry_count = 4;
        assert!(item.validate().is_err());
        assert_eq!(sample().retries_remaining(), 3);
    }
}
