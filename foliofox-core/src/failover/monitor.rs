//! Continuous health probing of the configured indexer backends.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use foliofox_config::FailoverConfig;
use foliofox_model::{
    HealthSample, HealthStatus, Indexer, IndexerId, IndexerType, RecoveryEvent,
};

use crate::catalog::{CatalogStore, LogLevel};
use crate::error::Result;
use crate::failover::probe::{ProbeClient, ProbeOutcome};
use crate::failover::rate_limit::BackendRateLimits;
use crate::failover::Balancer;

const COMPONENT: &str = "health_monitor";

/// Periodic prober driving breaker transitions and failover events.
pub struct HealthMonitor {
    store: CatalogStore,
    balancer: Arc<Balancer>,
    probes: ProbeClient,
    config: FailoverConfig,
    limits: Mutex<BackendRateLimits>,
    /// Indexers we have failed over away from and not yet recovered.
    failed: Mutex<HashSet<IndexerId>>,
    /// Recovery re-probe timestamps per indexer (rolling-hour throttle).
    recovery_log: Mutex<HashMap<IndexerId, VecDeque<DateTime<Utc>>>>,
    /// When the indexer was first marked failed, for downtime reporting.
    failed_since: Mutex<HashMap<IndexerId, DateTime<Utc>>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    pub fn new(
        store: CatalogStore,
        balancer: Arc<Balancer>,
        config: FailoverConfig,
    ) -> Result<Self> {
        let probes =
            ProbeClient::new(StdDuration::from_secs(config.probe_timeout_seconds))?;
        Ok(Self {
            store,
            balancer,
            probes,
            config,
            limits: Mutex::new(BackendRateLimits::new()),
            failed: Mutex::new(HashSet::new()),
            recovery_log: Mutex::new(HashMap::new()),
            failed_since: Mutex::new(HashMap::new()),
        })
    }

    /// Startup pass: disable misconfigured indexers, register the rest
    /// with the balancer, and restore breaker state from recent samples.
    pub async fn bootstrap(&self) -> Result<()> {
        let indexers = self.store.indexers().list_active().await?;
        let mut usable = Vec::with_capacity(indexers.len());
        for indexer in indexers {
            if let Err(reason) = validate_indexer_config(&indexer) {
                warn!(indexer = %indexer.name, reason, "disabling misconfigured indexer");
                self.store.indexers().set_active(indexer.id, false).await?;
                self.store
                    .logs()
                    .record(
                        LogLevel::Error,
                        COMPONENT,
                        &format!("indexer {} disabled: {reason}", indexer.name),
                        None,
                    )
                    .await?;
                continue;
            }
            usable.push(indexer);
        }
        self.balancer.sync_indexers(&usable);
        for indexer in &usable {
            let failures = self
                .store
                .health()
                .consecutive_failures(indexer.id)
                .await?;
            if failures > 0 {
                self.balancer.restore_breaker(indexer.id, failures);
            }
            if failures >= self.config.failure_threshold {
                self.failed.lock().expect("failed set").insert(indexer.id);
            }
        }
        info!(count = usable.len(), "health monitor bootstrapped");
        Ok(())
    }

    /// Probe loop. Runs until the shutdown token fires; a failing round
    /// never aborts the loop.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let interval =
            StdDuration::from_secs(self.config.health_check_interval_seconds.max(1));
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("health monitor shutting down");
                    return;
                }
                () = tokio::time::sleep(interval) => {}
            }
            if let Err(err) = self.run_probe_round().await {
                error!(%err, "health probe round failed");
            }
        }
    }

    /// One probe round over all active indexers, bounded by the
    /// concurrency semaphore and the per-backend rate caps.
    pub async fn run_probe_round(self: &Arc<Self>) -> Result<()> {
        let indexers = self.store.indexers().list_active().await?;
        self.balancer.sync_indexers(&indexers);

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_checks.max(1)));
        let mut probes = JoinSet::new();
        for indexer in indexers {
            let now = Utc::now();
            let admitted = self
                .limits
                .lock()
                .expect("rate limits")
                .try_admit(indexer.indexer_type, now)
                .is_none();
            if !admitted {
                debug!(indexer = %indexer.name, "probe skipped by backend rate cap");
                continue;
            }
            let monitor = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            probes.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = monitor.probes.probe(&indexer).await;
                (indexer, outcome)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let Ok((indexer, outcome)) = joined else {
                continue;
            };
            if let Err(err) = self.handle_outcome(&indexer, outcome).await {
                error!(indexer = %indexer.name, %err, "failed to record probe outcome");
            }
        }
        Ok(())
    }

    async fn handle_outcome(
        &self,
        indexer: &Indexer,
        outcome: ProbeOutcome,
    ) -> Result<()> {
        let now = Utc::now();
        let prior_failures = self.balancer.consecutive_failures(indexer.id);
        let failures_after = if outcome.ok { 0 } else { prior_failures + 1 };

        let success_rate = self.store.health().success_rate_24h(indexer.id).await?;
        let status = classify(
            outcome.ok,
            prior_failures,
            failures_after,
            self.config.failure_threshold,
            success_rate,
        );

        self.balancer.note_probe(
            indexer.id,
            outcome.ok,
            status,
            Some(outcome.response_time_ms),
            now,
        );
        self.store
            .health()
            .append(&HealthSample {
                indexer_id: indexer.id,
                status,
                response_time_ms: Some(outcome.response_time_ms),
                error: outcome.error.clone(),
                checked_at: now,
            })
            .await?;

        if matches!(status, HealthStatus::Down | HealthStatus::Degraded)
            && failures_after >= self.config.failure_threshold
        {
            self.trigger_failover(indexer, &outcome, now).await?;
        }

        if status == HealthStatus::Healthy || status == HealthStatus::Recovering {
            let marked_failed = self
                .failed
                .lock()
                .expect("failed set")
                .contains(&indexer.id);
            if marked_failed {
                self.attempt_recovery(indexer, now).await?;
            }
        }
        Ok(())
    }

    async fn trigger_failover(
        &self,
        indexer: &Indexer,
        outcome: &ProbeOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let newly_failed = self
            .failed
            .lock()
            .expect("failed set")
            .insert(indexer.id);
        if !newly_failed {
            return Ok(());
        }
        self.failed_since
            .lock()
            .expect("failed since")
            .entry(indexer.id)
            .or_insert(now);

        let reason = outcome
            .error
            .as_deref()
            .unwrap_or("health threshold exceeded");
        let event = self.balancer.begin_failover(indexer.id, reason, now);
        self.store
            .logs()
            .record(
                LogLevel::Warning,
                COMPONENT,
                &format!("failover from indexer {}", indexer.name),
                Some(serde_json::json!({
                    "from_id": event.from_id.as_i64(),
                    "to_id": event.to_id.map(IndexerId::as_i64),
                    "reason": event.reason,
                    "verified": event.verified,
                })),
            )
            .await?;
        Ok(())
    }

    /// Confirmation re-probe for an indexer that looks healthy again,
    /// throttled per rolling hour.
    async fn attempt_recovery(&self, indexer: &Indexer, now: DateTime<Utc>) -> Result<()> {
        {
            let mut log = self.recovery_log.lock().expect("recovery log");
            let attempts = log.entry(indexer.id).or_default();
            let horizon = now - Duration::hours(1);
            while attempts.front().is_some_and(|&at| at < horizon) {
                attempts.pop_front();
            }
            if attempts.len() as u32 >= self.config.max_recovery_attempts {
                debug!(indexer = %indexer.name, "recovery attempts throttled");
                return Ok(());
            }
            attempts.push_back(now);
        }

        let confirmation = self.probes.probe(indexer).await;
        if !confirmation.ok {
            debug!(indexer = %indexer.name, "recovery re-probe failed");
            return Ok(());
        }

        self.balancer.reset_breaker(indexer.id);
        self.failed.lock().expect("failed set").remove(&indexer.id);
        let downtime_seconds = self
            .failed_since
            .lock()
            .expect("failed since")
            .remove(&indexer.id)
            .map(|since| (now - since).num_seconds());

        let event = RecoveryEvent {
            indexer_id: indexer.id,
            downtime_seconds,
            occurred_at: now,
        };
        info!(indexer = %indexer.name, ?downtime_seconds, "indexer recovered");
        self.store
            .logs()
            .record(
                LogLevel::Info,
                COMPONENT,
                &format!("indexer {} recovered", indexer.name),
                Some(serde_json::to_value(&event)?),
            )
            .await?;
        Ok(())
    }
}

/// Classification of one probe outcome against the health table.
fn classify(
    probe_ok: bool,
    prior_failures: u32,
    failures_after: u32,
    failure_threshold: u32,
    success_rate_24h: Option<f64>,
) -> HealthStatus {
    if !probe_ok {
        return if failures_after >= failure_threshold {
            HealthStatus::Down
        } else {
            HealthStatus::Degraded
        };
    }
    if prior_failures > 0 {
        return HealthStatus::Recovering;
    }
    match success_rate_24h {
        None => HealthStatus::Healthy,
        Some(rate) if rate >= 95.0 => HealthStatus::Healthy,
        Some(rate) if rate >= 80.0 => HealthStatus::Degraded,
        Some(_) => HealthStatus::Down,
    }
}

fn validate_indexer_config(indexer: &Indexer) -> std::result::Result<(), String> {
    let url = Url::parse(&indexer.base_url)
        .map_err(|e| format!("invalid base_url: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme {}", url.scheme()));
    }
    let needs_key = matches!(
        indexer.indexer_type,
        IndexerType::Prowlarr | IndexerType::Jackett
    );
    if needs_key && indexer.api_key.as_deref().is_none_or(str::is_empty) {
        return Err("missing api key".to_string());
    }
    Ok(())
}
