//! Service runtime: wires the long-running loops under one cancellation
//! token and drains them on shutdown.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use foliofox_config::Config;

use crate::catalog::CatalogStore;
use crate::error::Result;
use crate::failover::breaker::BreakerConfig;
use crate::failover::monitor::HealthMonitor;
use crate::failover::selection::ScoreWeights;
use crate::failover::{Balancer, BalancerConfig};
use crate::maintenance::MaintenanceOrchestrator;
use crate::queue::QueueEngine;

/// Owns the component instances and their task handles. One per process.
pub struct Supervisor {
    store: CatalogStore,
    balancer: Arc<Balancer>,
    monitor: Arc<HealthMonitor>,
    engine: Arc<QueueEngine>,
    maintenance: Arc<MaintenanceOrchestrator>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("shutdown_requested", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Connect the catalog and build every component. Nothing runs until
    /// [`Supervisor::start`].
    pub async fn new(config: Config) -> Result<Self> {
        let store = CatalogStore::connect(&config.database).await?;

        let balancer = Arc::new(Balancer::new(BalancerConfig {
            strategy: config.failover.strategy,
            breaker: BreakerConfig {
                failure_threshold: config.failover.failure_threshold,
                recovery_timeout: chrono::Duration::seconds(
                    config.failover.recovery_timeout_seconds as i64,
                ),
            },
            weights: ScoreWeights::default(),
        }));
        let monitor = Arc::new(HealthMonitor::new(
            store.clone(),
            Arc::clone(&balancer),
            config.failover.clone(),
        )?);
        let engine = Arc::new(QueueEngine::new(
            store.clone(),
            config.downloads.clone(),
            config.monitoring.clone(),
        )?);
        let maintenance = Arc::new(MaintenanceOrchestrator::new(
            store.clone(),
            config.maintenance.clone(),
            config.backup.clone(),
        ));

        Ok(Self {
            store,
            balancer,
            monitor,
            engine,
            maintenance,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Bootstrap and spawn the health, queue, and maintenance loops.
    pub async fn start(&self) -> Result<()> {
        self.monitor.bootstrap().await?;

        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn({
            let monitor = Arc::clone(&self.monitor);
            let token = self.shutdown.clone();
            async move { monitor.run(token).await }
        }));
        handles.push(tokio::spawn({
            let engine = Arc::clone(&self.engine);
            let token = self.shutdown.clone();
            async move { engine.run(token).await }
        }));
        handles.push(tokio::spawn({
            let maintenance = Arc::clone(&self.maintenance);
            let token = self.shutdown.clone();
            async move { maintenance.run(token).await }
        }));
        info!("foliofox core started");
        Ok(())
    }

    /// Signal every loop and wait for them to drain. Download tasks
    /// release their temp files and requeue their rows on the way out.
    pub async fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(err) = handle.await {
                warn!(%err, "worker task ended abnormally");
            }
        }
        self.store.close().await;
        info!("foliofox core stopped");
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub fn balancer(&self) -> &Arc<Balancer> {
        &self.balancer
    }

    pub fn queue_engine(&self) -> &Arc<QueueEngine> {
        &self.engine
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceOrchestrator> {
        &self.maintenance
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}
