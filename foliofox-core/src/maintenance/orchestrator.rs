//! Dependency-ordered maintenance runs.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use foliofox_config::{BackupConfig, MaintenanceConfig};
use foliofox_model::{MaintenanceReport, MaintenanceTask, TaskKind, TaskStatus};

use crate::catalog::CatalogStore;
use crate::error::Result;
use crate::maintenance::backup::BackupManager;
use crate::maintenance::logrotate;
use crate::maintenance::tasks::DbMaintenance;
use crate::maintenance::TaskExecution;

/// Sequences the §full-run chain: integrity first, destructive work last,
/// anything downstream of a failure marked skipped.
#[derive(Debug)]
pub struct MaintenanceOrchestrator {
    store: CatalogStore,
    db: DbMaintenance,
    backup: BackupManager,
    config: MaintenanceConfig,
}

impl MaintenanceOrchestrator {
    pub fn new(
        store: CatalogStore,
        config: MaintenanceConfig,
        backup_config: BackupConfig,
    ) -> Self {
        let db = DbMaintenance::new(store.clone());
        let backup = BackupManager::new(store.clone(), backup_config);
        Self {
            store,
            db,
            backup,
            config,
        }
    }

    /// Timer loop for scheduled full runs.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = StdDuration::from_secs(
            self.config.full_run_interval_hours.max(1) * 60 * 60,
        );
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("maintenance orchestrator shutting down");
                    return;
                }
                () = tokio::time::sleep(interval) => {}
            }
            match self.run_full(&shutdown).await {
                Ok(report) => info!(
                    success_rate = report.success_rate(),
                    space_freed = report.total_space_freed_bytes,
                    "scheduled maintenance finished"
                ),
                Err(err) => error!(%err, "scheduled maintenance failed"),
            }
        }
    }

    /// Full chain: integrity → cleanup → analyze → [reindex] → [vacuum] →
    /// backup, then log rotation. A gate that does not fire (fragmentation
    /// or size below threshold) satisfies the chain; a failure or partial
    /// result skips everything downstream.
    pub async fn run_full(&self, cancel: &CancellationToken) -> Result<MaintenanceReport> {
        let run_id = uuid::Uuid::new_v4();
        let started_at = Utc::now();
        let mut tasks: Vec<MaintenanceTask> = Vec::new();
        info!(%run_id, "starting full maintenance run");

        let integrity = self
            .step(&mut tasks, TaskKind::IntegrityCheck, cancel, true, || {
                self.db.integrity_check()
            })
            .await;
        let mut chain_ok = integrity == TaskStatus::Completed;
        if !chain_ok {
            warn!("integrity check did not complete; destructive tasks skipped");
        }

        let cleanup = self
            .step(&mut tasks, TaskKind::Cleanup, cancel, chain_ok, || {
                self.db.cleanup(self.config.cleanup_retention_days)
            })
            .await;
        chain_ok = chain_ok && cleanup == TaskStatus::Completed;

        let analyze = self
            .step(&mut tasks, TaskKind::Analyze, cancel, chain_ok, || {
                self.db.analyze(None)
            })
            .await;
        chain_ok = chain_ok && analyze == TaskStatus::Completed;

        // Gates read current fragmentation/size; a quiet catalog skips
        // both destructive steps without breaking the chain.
        let fragmentation = self.db.fragmentation_percent().await.unwrap_or(0.0);
        let size_mb = self.db.database_size_bytes() / (1024 * 1024);

        if chain_ok && fragmentation > self.config.fragmentation_threshold_percent {
            let _guard = self.store.exclusive_session().await;
            let reindex = self
                .step(&mut tasks, TaskKind::Reindex, cancel, true, || {
                    self.db.reindex(None)
                })
                .await;
            chain_ok = chain_ok && reindex == TaskStatus::Completed;
        } else {
            self.record_skip(
                &mut tasks,
                TaskKind::Reindex,
                if chain_ok {
                    format!(
                        "fragmentation {fragmentation:.1}% below threshold {:.1}%",
                        self.config.fragmentation_threshold_percent
                    )
                } else {
                    "dependency did not complete".to_string()
                },
            )
            .await;
        }

        let vacuum_due = size_mb > self.config.auto_vacuum_threshold_mb
            || fragmentation > self.config.fragmentation_threshold_percent;
        if chain_ok && vacuum_due {
            let _guard = self.store.exclusive_session().await;
            // Vacuum cannot be interrupted mid-call; the cancel flag is
            // honoured before entering, not during.
            let vacuum = self
                .step(&mut tasks, TaskKind::Vacuum, cancel, true, || {
                    self.db.vacuum()
                })
                .await;
            chain_ok = chain_ok && vacuum == TaskStatus::Completed;
        } else {
            self.record_skip(
                &mut tasks,
                TaskKind::Vacuum,
                if chain_ok {
                    format!(
                        "size {size_mb} MB and fragmentation {fragmentation:.1}% below thresholds"
                    )
                } else {
                    "dependency did not complete".to_string()
                },
            )
            .await;
        }

        self.step(&mut tasks, TaskKind::Backup, cancel, chain_ok, || {
            self.backup.run()
        })
        .await;

        // Log rotation touches only the filesystem; it runs regardless of
        // the database chain.
        self.step(&mut tasks, TaskKind::LogRotation, cancel, true, || {
            logrotate::rotate_logs(&self.config)
        })
        .await;

        let report = MaintenanceReport {
            run_id,
            started_at,
            ended_at: Utc::now(),
            total_space_freed_bytes: tasks
                .iter()
                .filter_map(|t| t.space_freed_bytes)
                .sum(),
            tasks,
        };
        info!(
            %run_id,
            success_rate = report.success_rate(),
            "full maintenance run recorded"
        );
        Ok(report)
    }

    /// Quick run: integrity check plus a health snapshot, nothing
    /// destructive.
    pub async fn run_quick(&self) -> Result<MaintenanceReport> {
        let run_id = uuid::Uuid::new_v4();
        let started_at = Utc::now();
        let mut tasks = Vec::new();

        let execution = match self.db.integrity_check().await {
            Ok(mut execution) => {
                execution.details["health_snapshot"] = self.health_snapshot().await?;
                execution
            }
            Err(err) => TaskExecution::failed(err.to_string()),
        };
        self.record(&mut tasks, TaskKind::IntegrityCheck, started_at, execution)
            .await;

        Ok(MaintenanceReport {
            run_id,
            started_at,
            ended_at: Utc::now(),
            total_space_freed_bytes: 0,
            tasks,
        })
    }

    async fn health_snapshot(&self) -> Result<serde_json::Value> {
        let indexers = self.store.indexers().list_all().await?;
        let mut snapshot = serde_json::Map::new();
        for indexer in indexers {
            let latest = self.store.health().latest(indexer.id).await?;
            snapshot.insert(
                indexer.name,
                match latest {
                    Some(sample) => json!({
                        "status": sample.status.as_str(),
                        "checked_at": sample.checked_at,
                    }),
                    None => json!("never probed"),
                },
            );
        }
        Ok(serde_json::Value::Object(snapshot))
    }

    /// Run one step if its dependencies held and the run is not
    /// cancelled; otherwise record a skip. Returns the recorded status.
    async fn step<F, Fut>(
        &self,
        tasks: &mut Vec<MaintenanceTask>,
        kind: TaskKind,
        cancel: &CancellationToken,
        dependencies_ok: bool,
        op: F,
    ) -> TaskStatus
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<TaskExecution>>,
    {
        let started_at = Utc::now();
        let execution = if cancel.is_cancelled() {
            TaskExecution::skipped("run cancelled")
        } else if !dependencies_ok {
            TaskExecution::skipped("dependency did not complete")
        } else {
            match op().await {
                Ok(execution) => execution,
                Err(err) => {
                    error!(kind = kind.as_str(), %err, "maintenance task failed");
                    TaskExecution::failed(err.to_string())
                }
            }
        };
        self.record(tasks, kind, started_at, execution).await
    }

    async fn record_skip(
        &self,
        tasks: &mut Vec<MaintenanceTask>,
        kind: TaskKind,
        reason: String,
    ) -> TaskStatus {
        self.record(tasks, kind, Utc::now(), TaskExecution::skipped(reason))
            .await
    }

    async fn record(
        &self,
        tasks: &mut Vec<MaintenanceTask>,
        kind: TaskKind,
        started_at: chrono::DateTime<Utc>,
        execution: TaskExecution,
    ) -> TaskStatus {
        let ended_at = Utc::now();
        let task = MaintenanceTask {
            task_id: uuid::Uuid::new_v4(),
            kind,
            table: None,
            status: execution.status,
            started_at,
            ended_at: Some(ended_at),
            duration_s: Some((ended_at - started_at).num_milliseconds() as f64 / 1000.0),
            rows_affected: execution.rows_affected,
            space_freed_bytes: execution.space_freed_bytes,
            error: execution.error,
            details: execution.details,
        };
        if let Err(err) = self.store.maintenance().record(&task).await {
            error!(kind = kind.as_str(), %err, "failed to persist maintenance task");
        }
        let status = task.status;
        tasks.push(task);
        status
    }
}
