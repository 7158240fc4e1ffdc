//! Download queue behaviour: ordering, CAS starts, retries, staleness,
//! and full transfers against a local HTTP server.

use std::net::SocketAddr;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use foliofox_config::{
    DatabaseConfig, DownloadsConfig, MonitoringConfig, ResourceThresholds,
};
use foliofox_core::catalog::CatalogStore;
use foliofox_core::queue::QueueEngine;
use foliofox_model::{
    DownloadItem, DownloadStatus, Indexer, IndexerId, IndexerType, QueueItemId,
    UserId,
};

async fn file_store() -> (TempDir, CatalogStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DatabaseConfig {
        path: dir.path().join("foliofox.db"),
        ..DatabaseConfig::default()
    };
    let store = CatalogStore::connect(&config).await.expect("connect");
    (dir, store)
}

async fn seed_indexer(store: &CatalogStore) -> IndexerId {
    store
        .indexers()
        .create(&Indexer {
            id: IndexerId(0),
            name: "local".to_string(),
            indexer_type: IndexerType::Generic,
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: None,
            priority: 5,
            active: true,
            timeout_ms: 2_000,
            rate_limit_per_window: 100,
            window_ms: 60_000,
        })
        .await
        .expect("create indexer")
}

fn item(indexer_id: IndexerId, title: &str, url: &str, priority: u8) -> DownloadItem {
    let now = Utc::now();
    DownloadItem {
        id: QueueItemId(0),
        user_id: UserId(1),
        book_id: None,
        indexer_id,
        title: title.to_string(),
        author: None,
        url: url.to_string(),
        format: "epub".to_string(),
        size_bytes: None,
        priority,
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

fn engine_config(download_dir: &std::path::Path, max_concurrent: usize) -> DownloadsConfig {
    DownloadsConfig {
        max_concurrent,
        download_dir: download_dir.to_path_buf(),
        download_timeout_seconds: 5,
        scheduler_tick_seconds: 1,
        ..DownloadsConfig::default()
    }
}

fn lenient_monitoring() -> MonitoringConfig {
    // Unreachable ceilings keep host load out of the assertions.
    MonitoringConfig {
        resource_thresholds: ResourceThresholds {
            cpu_percent: 1_000.0,
            memory_percent: 1_000.0,
            disk_percent: 1_000.0,
        },
    }
}

/// Minimal one-shot HTTP server; `declared_length` controls whether a
/// Content-Length header is sent and what it claims.
async fn serve(
    body: Vec<u8>,
    declared_length: Option<u64>,
) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let body = body.clone();
            tokio::spawn(async move {
                let mut request = [0u8; 2048];
                let _ = socket.read(&mut request).await;
                let header = match declared_length {
                    Some(length) => format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {length}\r\nConnection: close\r\n\r\n"
                    ),
                    None => "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_string(),
                };
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (addr, handle)
}

async fn wait_for_status(
    store: &CatalogStore,
    id: QueueItemId,
    wanted: DownloadStatus,
) -> DownloadItem {
    for _ in 0..250 {
        let current = store
            .queue()
            .get(id)
            .await
            .expect("get item")
            .expect("item exists");
        if current.status == wanted {
            return current;
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    panic!("item {id} never reached {wanted}");
}

#[tokio::test]
async fn pending_order_prefers_priority_then_fresh_items() {
    let (_dir, store) = file_store().await;
    let indexer = seed_indexer(&store).await;
    let queue = store.queue();

    let low = queue
        .enqueue(&item(indexer, "low", "http://127.0.0.1:9/a", 9))
        .await
        .expect("enqueue");
    let urgent = queue
        .enqueue(&item(indexer, "urgent", "http://127.0.0.1:9/b", 1))
        .await
        .expect("enqueue");
    let retried = queue
        .enqueue(&item(indexer, "retried", "http://127.0.0.1:9/c", 1))
        .await
        .expect("enqueue");
    // Give the third row a retry history.
    sqlx::query("UPDATE download_queue SET retry_count = 1 WHERE id = ?")
        .bind(retried.as_i64())
        .execute(store.pool())
        .await
        .expect("backdate");

    let pending = queue.fetch_pending(10).await.expect("fetch");
    let ids: Vec<QueueItemId> = pending.iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![urgent, retried, low]);
}

#[tokio::test]
async fn try_start_is_single_winner() {
    let (_dir, store) = file_store().await;
    let indexer = seed_indexer(&store).await;
    let queue = store.queue();
    let id = queue
        .enqueue(&item(indexer, "cas", "http://127.0.0.1:9/a", 5))
        .await
        .expect("enqueue");

    assert!(queue.try_start(id).await.expect("first start"));
    assert!(!queue.try_start(id).await.expect("second start"));
}

#[tokio::test]
async fn completed_rows_satisfy_their_invariants() {
    let (_dir, store) = file_store().await;
    let indexer = seed_indexer(&store).await;
    let queue = store.queue();
    let id = queue
        .enqueue(&item(indexer, "done", "http://127.0.0.1:9/a", 5))
        .await
        .expect("enqueue");
    queue.try_start(id).await.expect("start");
    queue
        .mark_completed(id, "/books/done.epub", Some(42))
        .await
        .expect("complete");

    let loaded = queue.get(id).await.expect("get").expect("present");
    assert_eq!(loaded.status, DownloadStatus::Completed);
    assert_eq!(loaded.progress_pct, 100);
    loaded.validate().expect("completed invariants");

    use sqlx::Row;
    let history = sqlx::query(
        "SELECT final_status, download_duration_seconds FROM download_history WHERE queue_id = ?",
    )
    .bind(id.as_i64())
    .fetch_one(store.pool())
    .await
    .expect("history row");
    let final_status: String = history.try_get("final_status").expect("status");
    assert_eq!(final_status, "completed");
}

#[tokio::test]
async fn stale_download_resets_to_pending_keeping_retry_count() {
    let (_dir, store) = file_store().await;
    let indexer = seed_indexer(&store).await;
    let queue = store.queue();
    let id = queue
        .enqueue(&item(indexer, "stuck", "http://127.0.0.1:9/a", 5))
        .await
        .expect("enqueue");
    queue.try_start(id).await.expect("start");
    sqlx::query(
        "UPDATE download_queue SET retry_count = 2, max_retries = 3, updated_at = ? WHERE id = ?",
    )
    .bind(Utc::now() - Duration::minutes(61))
    .bind(id.as_i64())
    .execute(store.pool())
    .await
    .expect("backdate");

    let reset = queue.reset_stale(Duration::minutes(60)).await.expect("reset");
    assert_eq!(reset, vec![id]);

    let loaded = queue.get(id).await.expect("get").expect("present");
    assert_eq!(loaded.status, DownloadStatus::Pending);
    assert_eq!(loaded.retry_count, 2);
}

#[tokio::test]
async fn zero_concurrency_starts_nothing() {
    let (dir, store) = file_store().await;
    let indexer = seed_indexer(&store).await;
    store
        .queue()
        .enqueue(&item(indexer, "waiting", "http://127.0.0.1:9/a", 5))
        .await
        .expect("enqueue");

    let engine = QueueEngine::new(
        store.clone(),
        engine_config(&dir.path().join("downloads"), 0),
        lenient_monitoring(),
    )
    .expect("engine");
    let pass = engine.run_scheduler_pass().await.expect("pass");
    assert_eq!(pass.started, 0);
    assert_eq!(engine.active_downloads(), 0);
}

#[tokio::test]
async fn successful_transfer_completes_and_removes_temp_files() {
    let (dir, store) = file_store().await;
    let indexer = seed_indexer(&store).await;
    let body = b"ebook-bytes-go-here".to_vec();
    let (addr, _server) = serve(body.clone(), Some(body.len() as u64)).await;

    let id = store
        .queue()
        .enqueue(&item(
            indexer,
            "A Fine Novel",
            &format!("http://{addr}/book.epub"),
            5,
        ))
        .await
        .expect("enqueue");

    let downloads = dir.path().join("downloads");
    let engine = QueueEngine::new(
        store.clone(),
        engine_config(&downloads, 2),
        lenient_monitoring(),
    )
    .expect("engine");
    let pass = engine.run_scheduler_pass().await.expect("pass");
    assert_eq!(pass.started, 1);

    let done = wait_for_status(&store, id, DownloadStatus::Completed).await;
    assert_eq!(done.progress_pct, 100);
    let path = done.local_path.expect("path recorded");
    assert!(path.ends_with("A Fine Novel.epub"));
    assert_eq!(std::fs::read(&path).expect("file"), body);

    // No temp droppings left behind.
    let leftovers: Vec<_> = std::fs::read_dir(&downloads)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("temp_"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn size_mismatch_with_declared_length_fails_and_cleans_up() {
    let (dir, store) = file_store().await;
    let indexer = seed_indexer(&store).await;
    // Server declares 100 bytes but sends 10.
    let (addr, _server) = serve(b"0123456789".to_vec(), Some(100)).await;

    let id = store
        .queue()
        .enqueue(&item(indexer, "Short", &format!("http://{addr}/s.epub"), 5))
        .await
        .expect("enqueue");

    let downloads = dir.path().join("downloads");
    let engine = QueueEngine::new(
        store.clone(),
        engine_config(&downloads, 1),
        lenient_monitoring(),
    )
    .expect("engine");
    engine.run_scheduler_pass().await.expect("pass");

    let failed = wait_for_status(&store, id, DownloadStatus::Failed).await;
    assert_eq!(failed.retry_count, 1);
    let leftovers: Vec<_> = std::fs::read_dir(&downloads)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .collect();
    assert!(leftovers.is_empty(), "temp file must be removed on failure");
}

#[tokio::test]
async fn missing_content_length_treats_short_stream_as_success() {
    let (dir, store) = file_store().await;
    let indexer = seed_indexer(&store).await;
    let (addr, _server) = serve(b"whatever came through".to_vec(), None).await;

    let id = store
        .queue()
        .enqueue(&item(indexer, "Unsized", &format!("http://{addr}/u.epub"), 5))
        .await
        .expect("enqueue");

    let engine = QueueEngine::new(
        store.clone(),
        engine_config(&dir.path().join("downloads"), 1),
        lenient_monitoring(),
    )
    .expect("engine");
    engine.run_scheduler_pass().await.expect("pass");
    wait_for_status(&store, id, DownloadStatus::Completed).await;
}

#[tokio::test]
async fn rate_limited_item_waits_out_its_cooldown() {
    let (dir, store) = file_store().await;
    let indexer = seed_indexer(&store).await;
    let queue = store.queue();
    let id = queue
        .enqueue(&item(indexer, "limited", "http://127.0.0.1:9/r.epub", 5))
        .await
        .expect("enqueue");
    queue.try_start(id).await.expect("start");
    queue
        .mark_failed(id, "429 Too Many Requests", true)
        .await
        .expect("fail");

    let engine = QueueEngine::new(
        store.clone(),
        engine_config(&dir.path().join("downloads"), 1),
        lenient_monitoring(),
    )
    .expect("engine");

    // Freshly failed: inside the fixed 300 s backoff, nothing starts.
    let pass = engine.run_scheduler_pass().await.expect("pass");
    assert_eq!(pass.started, 0);

    // Backdate past the cooldown: the scheduler picks it up.
    sqlx::query("UPDATE download_queue SET updated_at = ? WHERE id = ?")
        .bind(Utc::now() - Duration::seconds(301))
        .bind(id.as_i64())
        .execute(store.pool())
        .await
        .expect("backdate");
    let pass = engine.run_scheduler_pass().await.expect("pass");
    assert_eq!(pass.started, 1);
}

#[tokio::test]
async fn permanent_failures_are_never_retried() {
    let (dir, store) = file_store().await;
    let indexer = seed_indexer(&store).await;
    let queue = store.queue();
    let id = queue
        .enqueue(&item(indexer, "gone", "http://127.0.0.1:9/g.epub", 5))
        .await
        .expect("enqueue");
    queue.try_start(id).await.expect("start");
    queue
        .mark_failed(id, "HTTP 404 Not Found", true)
        .await
        .expect("fail");
    sqlx::query("UPDATE download_queue SET updated_at = ? WHERE id = ?")
        .bind(Utc::now() - Duration::hours(5))
        .bind(id.as_i64())
        .execute(store.pool())
        .await
        .expect("backdate");

    let engine = QueueEngine::new(
        store.clone(),
        engine_config(&dir.path().join("downloads"), 1),
        lenient_monitoring(),
    )
    .expect("engine");
    let pass = engine.run_scheduler_pass().await.expect("pass");
    assert_eq!(pass.started, 0);

    let loaded = queue.get(id).await.expect("get").expect("present");
    assert_eq!(loaded.status, DownloadStatus::Failed);
}

#[tokio::test]
async fn queue_stats_reflect_current_rows() {
    let (_dir, store) = file_store().await;
    let indexer = seed_indexer(&store).await;
    let queue = store.queue();
    queue
        .enqueue(&item(indexer, "one", "http://127.0.0.1:9/1", 5))
        .await
        .expect("enqueue");
    let failing = queue
        .enqueue(&item(indexer, "two", "http://127.0.0.1:9/2", 5))
        .await
        .expect("enqueue");
    queue.try_start(failing).await.expect("start");
    queue
        .mark_failed(failing, "connection reset", true)
        .await
        .expect("fail");

    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.counts_by_status.get("pending"), Some(&1));
    assert_eq!(stats.counts_by_status.get("failed"), Some(&1));
    assert_eq!(stats.failed_last_hour, 1);
    assert_eq!(
        stats.failures_by_indexer.get(&indexer.as_i64()),
        Some(&1)
    );
}
