//! Scheduled catalog maintenance: integrity, cleanup, vacuum, backup.

pub mod backup;
pub mod logrotate;
pub mod orchestrator;
pub mod tasks;

use foliofox_model::TaskStatus;

pub use backup::BackupManager;
pub use orchestrator::MaintenanceOrchestrator;
pub use tasks::DbMaintenance;

/// Outcome of one maintenance operation, before it becomes a persisted
/// `maintenance_tasks` row.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub status: TaskStatus,
    pub rows_affected: Option<u64>,
    pub space_freed_bytes: Option<u64>,
    pub error: Option<String>,
    pub details: serde_json::Value,
}

impl TaskExecution {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Skipped,
            rows_affected: None,
            space_freed_bytes: None,
            error: Some(reason.into()),
            details: serde_json::Value::Null,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            rows_affected: None,
            space_freed_bytes: None,
            error: Some(error.into()),
            details: serde_json::Value::Null,
        }
    }
}
