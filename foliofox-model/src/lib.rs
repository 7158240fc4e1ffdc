//! Core data model definitions shared across FolioFox crates.

pub mod book;
pub mod dedup;
pub mod download;
pub mod error;
pub mod health;
pub mod ids;
pub mod indexer;
pub mod maintenance;

// Intentionally curated re-exports for downstream consumers.
pub use book::Book;
pub use dedup::{
    DuplicateGroup, DuplicateMatch, MatchConfidence, MatchKind, MergeAction,
    MergeSuggestion, PairKey,
};
pub use download::{
    DownloadHistoryEntry, DownloadItem, DownloadStatus, QueueStats,
};
pub use error::{ModelError, Result as ModelResult};
pub use health::{FailoverEvent, HealthSample, HealthStatus, RecoveryEvent};
pub use ids::{BookId, IndexerId, QueueItemId, UserId};
pub use indexer::{Indexer, IndexerType};
pub use maintenance::{
    MaintenanceReport, MaintenanceTask, TaskKind, TaskStatus,
};
