use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Kind of maintenance operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Vacuum,
    Reindex,
    Analyze,
    Cleanup,
    Backup,
    IntegrityCheck,
    LogRotation,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Vacuum => "vacuum",
            TaskKind::Reindex => "reindex",
            TaskKind::Analyze => "analyze",
            TaskKind::Cleanup => "cleanup",
            TaskKind::Backup => "backup",
            TaskKind::IntegrityCheck => "integrity_check",
            TaskKind::LogRotation => "log_rotation",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "vacuum" => Ok(TaskKind::Vacuum),
            "reindex" => Ok(TaskKind::Reindex),
            "analyze" => Ok(TaskKind::Analyze),
            "cleanup" => Ok(TaskKind::Cleanup),
            "backup" => Ok(TaskKind::Backup),
            "integrity_check" => Ok(TaskKind::IntegrityCheck),
            "log_rotation" => Ok(TaskKind::LogRotation),
            other => Err(ModelError::UnknownVariant("task kind", other.to_string())),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome state of one maintenance task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    /// Finished but surfaced violations (e.g. a failed integrity check).
    Partial,
    Failed,
    /// Not run because a dependency did not complete.
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Partial => "partial",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "partial" => Ok(TaskStatus::Partial),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            other => Err(ModelError::UnknownVariant(
                "task status",
                other.to_string(),
            )),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `maintenance_tasks` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceTask {
    pub task_id: uuid::Uuid,
    pub kind: TaskKind,
    /// Present when the task targeted a single table.
    pub table: Option<String>,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_s: Option<f64>,
    pub rows_affected: Option<u64>,
    pub space_freed_bytes: Option<u64>,
    pub error: Option<String>,
    /// Free-form task-specific details (sizes, file names, counts).
    pub details: serde_json::Value,
}

/// Summary of one orchestrated maintenance run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub run_id: uuid::Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub tasks: Vec<MaintenanceTask>,
    pub total_space_freed_bytes: u64,
}

impl MaintenanceReport {
    /// Fraction of tasks that completed; skips and partials count against it.
    pub fn success_rate(&self) -> f64 {
        if self.tasks.is_empty() {
            return 1.0;
        }
        let completed = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        completed as f64 / self.tasks.len() as f64
    }
}
