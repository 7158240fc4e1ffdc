//! The download scheduler: one supervisor loop, cooperative cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use foliofox_config::{DownloadsConfig, MonitoringConfig};
use foliofox_model::{DownloadItem, QueueItemId};

use crate::catalog::{CatalogStore, LogLevel};
use crate::error::Result;
use crate::queue::bandwidth::BandwidthLimiter;
use crate::queue::resources::ResourceMonitor;
use crate::queue::retry::{self, RetryPolicy};
use crate::queue::transfer::{self, TransferError, TransferSettings};

const COMPONENT: &str = "queue_engine";
/// Scheduler passes between priority-optimization sweeps.
const PRIORITY_SWEEP_EVERY: u32 = 30;

#[derive(Debug)]
struct ActiveTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// State shared between the supervisor loop and per-download tasks.
struct EngineShared {
    store: CatalogStore,
    config: DownloadsConfig,
    policy: RetryPolicy,
    bandwidth: BandwidthLimiter,
    client: reqwest::Client,
    settings: TransferSettings,
    active: Mutex<HashMap<QueueItemId, ActiveTask>>,
}

impl EngineShared {
    fn active_count(&self) -> usize {
        self.active.lock().expect("active map").len()
    }
}

/// Outcome of one scheduler pass, for observability and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerPass {
    pub started: usize,
    pub stale_reset: usize,
    pub throttled: bool,
    pub paused_for_maintenance: bool,
}

/// Concurrent, prioritized, retry-aware download scheduler.
pub struct QueueEngine {
    shared: Arc<EngineShared>,
    resources: Mutex<ResourceMonitor>,
    pass_counter: Mutex<u32>,
}

impl std::fmt::Debug for QueueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEngine")
            .field("active", &self.shared.active_count())
            .finish_non_exhaustive()
    }
}

impl QueueEngine {
    pub fn new(
        store: CatalogStore,
        config: DownloadsConfig,
        monitoring: MonitoringConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_concurrent.max(1))
            .build()?;
        let settings = TransferSettings {
            download_dir: config.download_dir.clone(),
            chunk_size: config.chunk_size_bytes,
            timeout: StdDuration::from_secs(config.download_timeout_seconds),
        };
        let resources = ResourceMonitor::new(
            monitoring.resource_thresholds,
            &config.download_dir,
        );
        Ok(Self {
            shared: Arc::new(EngineShared {
                policy: RetryPolicy::from_config(&config),
                bandwidth: BandwidthLimiter::from_limit(config.bandwidth_limit_mbps),
                client,
                settings,
                store,
                config,
                active: Mutex::new(HashMap::new()),
            }),
            resources: Mutex::new(resources),
            pass_counter: Mutex::new(0),
        })
    }

    /// Supervisor loop. A failing pass never aborts the loop; shutdown
    /// drains in-flight tasks and requeues whatever was interrupted.
    pub async fn run(&self, shutdown: CancellationToken) {
        let tick = StdDuration::from_secs(self.shared.config.scheduler_tick_seconds.max(1));
        let throttle = StdDuration::from_secs(self.shared.config.throttle_interval_seconds.max(1));
        loop {
            let pass = match self.run_scheduler_pass().await {
                Ok(pass) => pass,
                Err(err) => {
                    error!(%err, "scheduler pass failed");
                    SchedulerPass::default()
                }
            };
            let sleep = if pass.throttled { throttle } else { tick };
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(sleep) => {}
            }
        }
        self.drain().await;
    }

    /// One iteration of the scheduling algorithm.
    pub async fn run_scheduler_pass(&self) -> Result<SchedulerPass> {
        let mut pass = SchedulerPass::default();
        self.reap_finished();

        // Resource pressure pauses everything except stale recovery.
        if let Some((resource, value)) =
            self.resources.lock().expect("resource monitor").over_threshold()
        {
            warn!(resource, value, "resource threshold exceeded, throttling");
            pass.throttled = true;
            return Ok(pass);
        }

        // Destructive maintenance holds the exclusive session; let
        // in-flight streams continue but start nothing new.
        if self.shared.store.exclusive_session_active() {
            debug!("maintenance session active, pausing new downloads");
            pass.paused_for_maintenance = true;
            pass.stale_reset = self.reset_stale().await?;
            return Ok(pass);
        }

        let available = self
            .shared
            .config
            .max_concurrent
            .saturating_sub(self.shared.active_count());

        if available > 0 {
            let queue = self.shared.store.queue();
            let mut slots = available;

            for item in queue.fetch_pending(slots).await? {
                if self.start_item(item).await? {
                    pass.started += 1;
                    slots -= 1;
                }
                if slots == 0 {
                    break;
                }
            }

            if slots > 0 {
                for item in self.eligible_retries().await? {
                    if queue.mark_retrying(item.id).await? && self.start_item(item).await? {
                        pass.started += 1;
                        slots -= 1;
                    }
                    if slots == 0 {
                        break;
                    }
                }
            }
        }

        pass.stale_reset = self.reset_stale().await?;
        self.maybe_optimize_priorities().await?;
        Ok(pass)
    }

    /// Retry-eligible failed items after cooldown and the smart filter.
    async fn eligible_retries(&self) -> Result<Vec<DownloadItem>> {
        let queue = self.shared.store.queue();
        let candidates = queue.fetch_retry_candidates().await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let failures_by_indexer = queue
            .indexer_failure_counts(Duration::hours(1))
            .await?;
        let now = Utc::now();

        let mut eligible = Vec::new();
        for item in candidates {
            let message = item.error_message.as_deref().unwrap_or("");
            let kind = retry::classify(message);
            if kind.is_local_resource() {
                continue;
            }
            let cooldown = self.shared.policy.base_delay_for(kind, item.retry_count);
            let ready_at = item.updated_at
                + Duration::from_std(cooldown).unwrap_or_else(|_| Duration::hours(1));
            if ready_at > now {
                continue;
            }
            if self.shared.config.smart_retry {
                let indexer_failures = failures_by_indexer
                    .get(&item.indexer_id.as_i64())
                    .copied()
                    .unwrap_or(0);
                if retry::should_skip_retry(message, indexer_failures) {
                    debug!(item = %item.id, "smart retry suppressed");
                    continue;
                }
            }
            eligible.push(item);
        }
        Ok(eligible)
    }

    /// Claim the row and spawn the transfer task. Returns false when the
    /// compare-and-set lost to another claimant.
    async fn start_item(&self, item: DownloadItem) -> Result<bool> {
        if !self.shared.store.queue().try_start(item.id).await? {
            return Ok(false);
        }
        let shared = Arc::clone(&self.shared);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let id = item.id;

        let handle = tokio::spawn(async move {
            run_transfer_task(&shared, item, task_cancel).await;
            shared.active.lock().expect("active map").remove(&id);
        });
        self.shared
            .active
            .lock()
            .expect("active map")
            .insert(id, ActiveTask { cancel, handle });
        Ok(true)
    }

    /// Reset stalled rows and cancel any live task still attached to them.
    async fn reset_stale(&self) -> Result<usize> {
        let stale_after = Duration::minutes(self.shared.config.stale_threshold_minutes);
        let reset = self.shared.store.queue().reset_stale(stale_after).await?;
        for id in &reset {
            if let Some(task) = self.shared.active.lock().expect("active map").remove(id) {
                task.cancel.cancel();
                task.handle.abort();
            }
            self.shared
                .store
                .logs()
                .record(
                    LogLevel::Warning,
                    COMPONENT,
                    &format!("stale download {id} reset to pending"),
                    None,
                )
                .await?;
        }
        Ok(reset.len())
    }

    async fn maybe_optimize_priorities(&self) -> Result<()> {
        {
            let mut counter = self.pass_counter.lock().expect("pass counter");
            *counter += 1;
            if *counter < PRIORITY_SWEEP_EVERY {
                return Ok(());
            }
            *counter = 0;
        }
        let under_load = self.shared.active_count() as f64
            >= self.shared.config.max_concurrent as f64 * 0.8;
        let adjusted = self
            .shared
            .store
            .queue()
            .optimize_priorities(under_load)
            .await?;
        if adjusted > 0 {
            debug!(adjusted, under_load, "rebalanced queue priorities");
        }
        Ok(())
    }

    fn reap_finished(&self) {
        self.shared
            .active
            .lock()
            .expect("active map")
            .retain(|_, task| !task.handle.is_finished());
    }

    /// Number of live download tasks.
    pub fn active_downloads(&self) -> usize {
        self.shared.active_count()
    }

    /// Cancel all in-flight tasks and put their rows back to `pending`.
    async fn drain(&self) {
        let drained: Vec<(QueueItemId, ActiveTask)> = {
            let mut active = self.shared.active.lock().expect("active map");
            active.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "draining in-flight downloads");
        for (id, task) in drained {
            task.cancel.cancel();
            let _ = task.handle.await;
            if let Err(err) = self.shared.store.queue().requeue(id).await {
                error!(%id, %err, "failed to requeue interrupted download");
            }
        }
    }
}

/// Body of one spawned download task: run the transfer, then finalize the
/// row. Failures are classified and never propagate to the scheduler.
async fn run_transfer_task(
    shared: &EngineShared,
    item: DownloadItem,
    cancel: CancellationToken,
) {
    let queue = shared.store.queue();
    let outcome = transfer::run(
        &shared.client,
        &item,
        &shared.settings,
        &shared.bandwidth,
        &queue,
        &cancel,
    )
    .await;

    match outcome {
        Ok(done) => {
            let path = done.local_path.to_string_lossy();
            if let Err(err) = queue
                .mark_completed(item.id, &path, Some(done.bytes_written))
                .await
            {
                error!(item = %item.id, %err, "failed to record completion");
                return;
            }
            info!(item = %item.id, bytes = done.bytes_written, "download completed");
        }
        Err(TransferError::Cancelled) => {
            debug!(item = %item.id, "download cancelled");
            // Row state is settled by the canceller (stale reset or drain).
        }
        Err(TransferError::Failed(message)) => {
            let kind = retry::classify(&message);
            let can_retry =
                !kind.is_local_resource() && item.retry_count + 1 <= item.max_retries;
            if let Err(err) = queue.mark_failed(item.id, &message, can_retry).await {
                error!(item = %item.id, %err, "failed to record failure");
                return;
            }
            warn!(
                item = %item.id,
                reason = kind.as_str(),
                retry = can_retry,
                %message,
                "download failed"
            );
            if kind.is_local_resource() {
                let _ = shared
                    .store
                    .logs()
                    .record(
                        LogLevel::Error,
                        COMPONENT,
                        &format!("download {} hit local resource error: {message}", item.id),
                        Some(serde_json::json!({ "reason": kind.as_str() })),
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::retry::FailureKind;

    #[test]
    fn test_local_resource_failures_never_retry() {
        let kind = retry::classify("No space left on device");
        assert_eq!(kind, FailureKind::DiskFull);
        assert!(kind.is_local_resource());
    }
}
