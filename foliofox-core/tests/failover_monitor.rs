//! Health monitor end to end against unreachable local backends:
//! classification, breaker trips, failover events, and state rebuild.

use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use foliofox_config::{DatabaseConfig, FailoverConfig, FailoverStrategy};
use foliofox_core::catalog::CatalogStore;
use foliofox_core::failover::breaker::{BreakerConfig, BreakerState};
use foliofox_core::failover::monitor::HealthMonitor;
use foliofox_core::failover::selection::ScoreWeights;
use foliofox_core::failover::{Balancer, BalancerConfig};
use foliofox_model::{HealthStatus, Indexer, IndexerId, IndexerType};

async fn file_store() -> (TempDir, CatalogStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DatabaseConfig {
        path: dir.path().join("foliofox.db"),
        ..DatabaseConfig::default()
    };
    let store = CatalogStore::connect(&config).await.expect("connect");
    (dir, store)
}

fn unreachable_indexer(name: &str, priority: u8) -> Indexer {
    Indexer {
        id: IndexerId(0),
        name: name.to_string(),
        // Closed port: probes fail fast with connection refused.
        base_url: "http://127.0.0.1:9".to_string(),
        api_key: None,
        indexer_type: IndexerType::Generic,
        priority,
        active: true,
        timeout_ms: 500,
        rate_limit_per_window: 10,
        window_ms: 60_000,
    }
}

fn monitor_config(failure_threshold: u32) -> FailoverConfig {
    FailoverConfig {
        failure_threshold,
        health_check_interval_seconds: 1,
        probe_timeout_seconds: 1,
        ..FailoverConfig::default()
    }
}

fn balancer(failure_threshold: u32) -> Arc<Balancer> {
    Arc::new(Balancer::new(BalancerConfig {
        strategy: FailoverStrategy::Priority,
        breaker: BreakerConfig {
            failure_threshold,
            recovery_timeout: chrono::Duration::seconds(60),
        },
        weights: ScoreWeights::default(),
    }))
}

#[tokio::test]
async fn failing_probes_trip_breaker_and_record_failover() {
    let (_dir, store) = file_store().await;
    let id = store
        .indexers()
        .create(&unreachable_indexer("down", 1))
        .await
        .expect("create");

    let balancer = balancer(3);
    let monitor = Arc::new(
        HealthMonitor::new(store.clone(), Arc::clone(&balancer), monitor_config(3))
            .expect("monitor"),
    );
    monitor.bootstrap().await.expect("bootstrap");

    for _ in 0..3 {
        monitor.run_probe_round().await.expect("round");
    }

    assert_eq!(balancer.breaker_state(id), Some(BreakerState::Open));
    // Degraded below the threshold, down at and beyond it.
    let samples = store
        .health()
        .since(id, Utc::now() - chrono::Duration::hours(1))
        .await
        .expect("samples");
    assert_eq!(samples.len(), 3);
    assert_eq!(samples[0].status, HealthStatus::Down);
    assert_eq!(samples[2].status, HealthStatus::Degraded);

    // The failover was audited even though no alternative exists.
    assert!(store.logs().count().await.expect("count") >= 1);
}

#[tokio::test]
async fn probes_skip_inactive_and_misconfigured_indexers() {
    let (_dir, store) = file_store().await;
    let mut prowlarr = unreachable_indexer("no-key", 1);
    prowlarr.indexer_type = IndexerType::Prowlarr;
    prowlarr.api_key = None;
    let id = store.indexers().create(&prowlarr).await.expect("create");

    let balancer = balancer(3);
    let monitor = Arc::new(
        HealthMonitor::new(store.clone(), Arc::clone(&balancer), monitor_config(3))
            .expect("monitor"),
    );
    monitor.bootstrap().await.expect("bootstrap");

    // Bootstrap disabled it for missing credentials.
    let reloaded = store.indexers().get(id).await.expect("get").expect("present");
    assert!(!reloaded.active);

    monitor.run_probe_round().await.expect("round");
    let latest = store.health().latest(id).await.expect("latest");
    assert!(latest.is_none(), "disabled indexers are not probed");
}

#[tokio::test]
async fn breaker_state_rebuilds_from_recent_samples() {
    let (_dir, store) = file_store().await;
    let id = store
        .indexers()
        .create(&unreachable_indexer("flappy", 1))
        .await
        .expect("create");

    for _ in 0..5 {
        store
            .health()
            .append(&foliofox_model::HealthSample {
                indexer_id: id,
                status: HealthStatus::Down,
                response_time_ms: None,
                error: Some("connection refused".to_string()),
                checked_at: Utc::now(),
            })
            .await
            .expect("append");
    }

    // A fresh process restores the open breaker from the sample history.
    let balancer = balancer(5);
    let monitor = Arc::new(
        HealthMonitor::new(store.clone(), Arc::clone(&balancer), monitor_config(5))
            .expect("monitor"),
    );
    monitor.bootstrap().await.expect("bootstrap");
    assert_eq!(balancer.breaker_state(id), Some(BreakerState::Open));
    assert_eq!(balancer.select_target(Utc::now()), None);
}

#[tokio::test]
async fn healthy_alternative_receives_failover_target() {
    let (_dir, store) = file_store().await;
    let failing = store
        .indexers()
        .create(&unreachable_indexer("failing", 1))
        .await
        .expect("create");
    let backup = store
        .indexers()
        .create(&unreachable_indexer("backup", 5))
        .await
        .expect("create");

    let balancer = balancer(2);
    let monitor = Arc::new(
        HealthMonitor::new(store.clone(), Arc::clone(&balancer), monitor_config(2))
            .expect("monitor"),
    );
    monitor.bootstrap().await.expect("bootstrap");

    // Both fail, but the one that trips first fails over to the other
    // while the other's breaker still allows calls.
    monitor.run_probe_round().await.expect("round");
    monitor.run_probe_round().await.expect("round");

    assert_eq!(balancer.breaker_state(failing), Some(BreakerState::Open));
    assert_eq!(balancer.breaker_state(backup), Some(BreakerState::Open));
    assert!(store.logs().count().await.expect("count") >= 2);
}
