//! Maintenance orchestration: dependency skips, cleanup idempotence,
//! backup with verification and retention.

use chrono::{Duration, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use foliofox_config::{BackupConfig, DatabaseConfig, MaintenanceConfig};
use foliofox_core::catalog::{CatalogStore, LogLevel};
use foliofox_core::maintenance::{DbMaintenance, MaintenanceOrchestrator};
use foliofox_model::{TaskKind, TaskStatus};

async fn file_store() -> (TempDir, CatalogStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DatabaseConfig {
        path: dir.path().join("foliofox.db"),
        // One connection so session-scoped pragmas in tests stick.
        max_connections: 1,
        ..DatabaseConfig::default()
    };
    let store = CatalogStore::connect(&config).await.expect("connect");
    (dir, store)
}

fn orchestrator(dir: &TempDir, store: &CatalogStore) -> MaintenanceOrchestrator {
    MaintenanceOrchestrator::new(
        store.clone(),
        MaintenanceConfig {
            log_dir: dir.path().join("logs"),
            ..MaintenanceConfig::default()
        },
        BackupConfig {
            backup_dir: dir.path().join("backups"),
            ..BackupConfig::default()
        },
    )
}

fn status_of(report: &foliofox_model::MaintenanceReport, kind: TaskKind) -> TaskStatus {
    report
        .tasks
        .iter()
        .find(|t| t.kind == kind)
        .unwrap_or_else(|| panic!("no {kind} task recorded"))
        .status
}

#[tokio::test]
async fn clean_catalog_runs_the_full_chain() {
    let (dir, store) = file_store().await;
    let orchestrator = orchestrator(&dir, &store);

    let report = orchestrator
        .run_full(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(status_of(&report, TaskKind::IntegrityCheck), TaskStatus::Completed);
    assert_eq!(status_of(&report, TaskKind::Cleanup), TaskStatus::Completed);
    assert_eq!(status_of(&report, TaskKind::Analyze), TaskStatus::Completed);
    // A fresh catalog is neither fragmented nor oversized.
    assert_eq!(status_of(&report, TaskKind::Reindex), TaskStatus::Skipped);
    assert_eq!(status_of(&report, TaskKind::Vacuum), TaskStatus::Skipped);
    assert_eq!(status_of(&report, TaskKind::Backup), TaskStatus::Completed);
    assert_eq!(status_of(&report, TaskKind::LogRotation), TaskStatus::Completed);

    // The backup landed, compressed, in the backup directory.
    let backups: Vec<_> = std::fs::read_dir(dir.path().join("backups"))
        .expect("backup dir")
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(backups.len(), 1);
    assert!(
        backups[0]
            .file_name()
            .to_string_lossy()
            .ends_with(".db.gz")
    );
}

#[tokio::test]
async fn integrity_violation_skips_every_destructive_task() {
    let (dir, store) = file_store().await;

    // Plant a foreign-key violation with enforcement off for the session.
    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(store.pool())
        .await
        .expect("pragma");
    sqlx::query(
        "INSERT INTO download_queue \
         (user_id, indexer_id, title, url, format, created_at, updated_at) \
         VALUES (1, 9999, 'orphan', 'http://x', 'epub', ?, ?)",
    )
    .bind(Utc::now())
    .bind(Utc::now())
    .execute(store.pool())
    .await
    .expect("orphan row");

    let orchestrator = orchestrator(&dir, &store);
    let report = orchestrator
        .run_full(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(status_of(&report, TaskKind::IntegrityCheck), TaskStatus::Partial);
    for kind in [
        TaskKind::Cleanup,
        TaskKind::Analyze,
        TaskKind::Reindex,
        TaskKind::Vacuum,
        TaskKind::Backup,
    ] {
        assert_eq!(status_of(&report, kind), TaskStatus::Skipped, "{kind}");
    }
    // Success rate counts the skips against the run.
    assert!(report.success_rate() < 0.5);
}

#[tokio::test]
async fn cleanup_twice_removes_nothing_more() {
    let (_dir, store) = file_store().await;
    let logs = store.logs();
    // Old prunable row plus an ERROR row that must survive.
    logs.record(LogLevel::Info, "test", "old info", None)
        .await
        .expect("record");
    logs.record(LogLevel::Error, "test", "old error", None)
        .await
        .expect("record");
    sqlx::query("UPDATE system_logs SET created_at = ?")
        .bind(Utc::now() - Duration::days(90))
        .execute(store.pool())
        .await
        .expect("backdate");

    let maintenance = DbMaintenance::new(store.clone());
    let first = maintenance.cleanup(30).await.expect("first cleanup");
    assert_eq!(first.rows_affected, Some(1));
    assert_eq!(logs.count().await.expect("count"), 1);

    let second = maintenance.cleanup(30).await.expect("second cleanup");
    assert_eq!(second.rows_affected, Some(0));
}

#[tokio::test]
async fn health_samples_keep_latest_per_indexer() {
    let (_dir, store) = file_store().await;
    let indexer_id = store
        .indexers()
        .create(&foliofox_model::Indexer {
            id: foliofox_model::IndexerId(0),
            name: "ix".to_string(),
            indexer_type: foliofox_model::IndexerType::Generic,
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: None,
            priority: 5,
            active: true,
            timeout_ms: 1_000,
            rate_limit_per_window: 10,
            window_ms: 60_000,
        })
        .await
        .expect("indexer");

    for days_ago in [40_i64, 35] {
        store
            .health()
            .append(&foliofox_model::HealthSample {
                indexer_id,
                status: foliofox_model::HealthStatus::Healthy,
                response_time_ms: Some(10),
                error: None,
                checked_at: Utc::now() - Duration::days(days_ago),
            })
            .await
            .expect("append");
    }

    let removed = store.health().prune(Duration::days(30)).await.expect("prune");
    assert_eq!(removed, 1);
    // The newest sample survives even though it is past retention.
    assert!(store.health().latest(indexer_id).await.expect("latest").is_some());
}

#[tokio::test]
async fn backup_verifies_and_culls_by_filename_timestamp() {
    let (dir, store) = file_store().await;
    let backup_dir = dir.path().join("backups");
    std::fs::create_dir_all(&backup_dir).expect("mkdir");

    // An expired backup and a file that does not parse as one.
    std::fs::write(
        backup_dir.join("foliofox_backup_20200101_000000.db"),
        b"old",
    )
    .expect("seed old backup");
    std::fs::write(backup_dir.join("unrelated.txt"), b"keep me").expect("seed other");

    let manager = foliofox_core::maintenance::BackupManager::new(
        store.clone(),
        BackupConfig {
            backup_dir: backup_dir.clone(),
            enable_compression: false,
            enable_verification: true,
            retention_days: 30,
        },
    );
    let execution = manager.run().await.expect("backup");
    assert_eq!(execution.status, TaskStatus::Completed);
    assert_eq!(execution.details["verified"], serde_json::json!(true));

    let names: Vec<String> = std::fs::read_dir(&backup_dir)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().any(|n| n == "unrelated.txt"));
    assert!(!names.iter().any(|n| n == "foliofox_backup_20200101_000000.db"));
    // Exactly one fresh backup remains alongside the unrelated file.
    assert_eq!(names.len(), 2);
}

#[tokio::test]
async fn quick_run_checks_integrity_only() {
    let (dir, store) = file_store().await;
    let orchestrator = orchestrator(&dir, &store);
    let report = orchestrator.run_quick().await.expect("quick run");
    assert_eq!(report.tasks.len(), 1);
    assert_eq!(report.tasks[0].kind, TaskKind::IntegrityCheck);
    assert_eq!(report.tasks[0].status, TaskStatus::Completed);
    assert!(report.tasks[0].details.get("health_snapshot").is_some());
}
