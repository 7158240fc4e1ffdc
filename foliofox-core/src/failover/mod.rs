//! Indexer failure isolation and request routing.
//!
//! [`breaker`] gates calls per indexer, [`selection`] picks a target among
//! the permitted ones, [`rate_limit`] caps probe traffic per backend type,
//! and [`monitor`] drives the probe cadence that feeds all of it. The
//! [`Balancer`] is the process-local aggregation point; it owns no durable
//! state and is rebuilt from recent health samples on restart.

pub mod breaker;
pub mod monitor;
pub mod probe;
pub mod rate_limit;
pub mod selection;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use tracing::{info, warn};

use foliofox_config::FailoverStrategy;
use foliofox_model::{FailoverEvent, HealthStatus, Indexer, IndexerId};

use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use selection::{CandidateStats, ScoreWeights};

/// Response-time ring capacity per indexer.
const RESPONSE_TIME_WINDOW: usize = 100;

/// Balancer tuning.
#[derive(Debug, Clone, Copy)]
pub struct BalancerConfig {
    pub strategy: FailoverStrategy,
    pub breaker: BreakerConfig,
    pub weights: ScoreWeights,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: FailoverStrategy::Intelligent,
            breaker: BreakerConfig::default(),
            weights: ScoreWeights::default(),
        }
    }
}

#[derive(Debug)]
struct IndexerRuntime {
    priority: u8,
    active: bool,
    status: HealthStatus,
    breaker: CircuitBreaker,
    response_times: VecDeque<u64>,
    success_count: u64,
    failure_count: u64,
    request_count: u64,
}

impl IndexerRuntime {
    fn new(indexer: &Indexer, breaker_config: BreakerConfig) -> Self {
        Self {
            priority: indexer.priority,
            active: indexer.active,
            status: HealthStatus::Healthy,
            breaker: CircuitBreaker::new(breaker_config),
            response_times: VecDeque::with_capacity(RESPONSE_TIME_WINDOW),
            success_count: 0,
            failure_count: 0,
            request_count: 0,
        }
    }

    fn push_response_time(&mut self, ms: u64) {
        if self.response_times.len() == RESPONSE_TIME_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(ms);
    }

    fn stats(&self, id: IndexerId) -> CandidateStats {
        CandidateStats {
            indexer_id: id,
            priority: self.priority,
            status: self.status,
            last_response_time_ms: self.response_times.back().copied(),
            success_count: self.success_count,
            failure_count: self.failure_count,
            request_count: self.request_count,
            consecutive_failures: self.breaker.consecutive_failures(),
        }
    }
}

#[derive(Debug)]
struct PendingFailover {
    event: FailoverEvent,
}

#[derive(Debug, Default)]
struct BalancerInner {
    indexers: HashMap<IndexerId, IndexerRuntime>,
    round_robin_cursor: usize,
    pending_failovers: Vec<PendingFailover>,
}

/// Process-local request router over the configured indexers.
#[derive(Debug)]
pub struct Balancer {
    config: BalancerConfig,
    inner: Mutex<BalancerInner>,
}

impl Balancer {
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BalancerInner::default()),
        }
    }

    /// Register or refresh the runtime entries for the configured
    /// indexers, dropping entries whose rows disappeared.
    pub fn sync_indexers(&self, indexers: &[Indexer]) {
        let mut inner = self.inner.lock().expect("balancer lock");
        inner
            .indexers
            .retain(|id, _| indexers.iter().any(|ix| ix.id == *id));
        for indexer in indexers {
            match inner.indexers.get_mut(&indexer.id) {
                Some(runtime) => {
                    runtime.priority = indexer.priority;
                    runtime.active = indexer.active;
                }
                None => {
                    inner.indexers.insert(
                        indexer.id,
                        IndexerRuntime::new(indexer, self.config.breaker),
                    );
                }
            }
        }
    }

    /// Restore one breaker from a persisted consecutive-failure count.
    pub fn restore_breaker(&self, id: IndexerId, consecutive_failures: u32) {
        let mut inner = self.inner.lock().expect("balancer lock");
        if let Some(runtime) = inner.indexers.get_mut(&id) {
            runtime.breaker =
                CircuitBreaker::restore(self.config.breaker, consecutive_failures);
        }
    }

    /// Pick a target among active indexers whose breaker currently allows
    /// calls, and count the routed request against it.
    pub fn select_target(&self, now: DateTime<Utc>) -> Option<IndexerId> {
        self.select_target_excluding(now, None)
    }

    /// Same as [`Balancer::select_target`] but never returns `exclude`
    /// (used when picking a failover destination).
    pub fn select_target_excluding(
        &self,
        now: DateTime<Utc>,
        exclude: Option<IndexerId>,
    ) -> Option<IndexerId> {
        let mut inner = self.inner.lock().expect("balancer lock");
        let mut candidates = Vec::new();
        for (&id, runtime) in inner.indexers.iter_mut() {
            if !runtime.active || Some(id) == exclude {
                continue;
            }
            if runtime.breaker.allows_request(now) {
                candidates.push(runtime.stats(id));
            }
        }
        candidates.sort_by_key(|c| c.indexer_id);

        let selected = selection::select(
            self.config.strategy,
            &candidates,
            &mut inner.round_robin_cursor,
            self.config.weights,
        )?;
        if let Some(runtime) = inner.indexers.get_mut(&selected) {
            runtime.request_count += 1;
        }
        Some(selected)
    }

    /// Record the outcome of a request routed through `id`. Updates the
    /// breaker, the response-time ring, and cumulative counts; returns any
    /// failover events this outcome just verified.
    pub fn record_result(
        &self,
        id: IndexerId,
        success: bool,
        response_time_ms: Option<u64>,
        now: DateTime<Utc>,
    ) -> Vec<FailoverEvent> {
        let mut inner = self.inner.lock().expect("balancer lock");
        if let Some(runtime) = inner.indexers.get_mut(&id) {
            if let Some(ms) = response_time_ms {
                runtime.push_response_time(ms);
            }
            if success {
                runtime.success_count += 1;
                runtime.breaker.record_success();
            } else {
                runtime.failure_count += 1;
                runtime.breaker.record_failure(now);
            }
        }
        if !success {
            return Vec::new();
        }
        // A success through a failover target proves the redirect worked.
        let mut verified = Vec::new();
        let mut index = 0;
        while index < inner.pending_failovers.len() {
            if inner.pending_failovers[index].event.to_id == Some(id) {
                let mut pending = inner.pending_failovers.swap_remove(index);
                pending.event.verified = true;
                verified.push(pending.event);
            } else {
                index += 1;
            }
        }
        verified
    }

    /// Emit a failover away from `from`: select an alternative target and
    /// track the event until a success through the target verifies it.
    pub fn begin_failover(
        &self,
        from: IndexerId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> FailoverEvent {
        let to_id = self.select_target_excluding(now, Some(from));
        let event = FailoverEvent {
            from_id: from,
            to_id,
            reason: reason.to_string(),
            verified: false,
            occurred_at: now,
        };
        match to_id {
            Some(to) => {
                info!(%from, %to, reason, "failover target selected");
                let mut inner = self.inner.lock().expect("balancer lock");
                inner.pending_failovers.push(PendingFailover {
                    event: event.clone(),
                });
            }
            None => warn!(%from, reason, "failover requested but no target available"),
        }
        event
    }

    /// Feed one probe outcome into the breaker and status bookkeeping.
    pub fn note_probe(
        &self,
        id: IndexerId,
        ok: bool,
        status: HealthStatus,
        response_time_ms: Option<u64>,
        now: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().expect("balancer lock");
        if let Some(runtime) = inner.indexers.get_mut(&id) {
            runtime.status = status;
            if let Some(ms) = response_time_ms {
                runtime.push_response_time(ms);
            }
            if ok {
                runtime.breaker.record_success();
            } else {
                runtime.breaker.record_failure(now);
            }
        }
    }

    pub fn reset_breaker(&self, id: IndexerId) {
        let mut inner = self.inner.lock().expect("balancer lock");
        if let Some(runtime) = inner.indexers.get_mut(&id) {
            runtime.breaker.reset();
        }
    }

    pub fn breaker_state(&self, id: IndexerId) -> Option<BreakerState> {
        let inner = self.inner.lock().expect("balancer lock");
        inner.indexers.get(&id).map(|r| r.breaker.state())
    }

    pub fn consecutive_failures(&self, id: IndexerId) -> u32 {
        let inner = self.inner.lock().expect("balancer lock");
        inner
            .indexers
            .get(&id)
            .map(|r| r.breaker.consecutive_failures())
            .unwrap_or(0)
    }

    pub fn candidate_stats(&self, id: IndexerId) -> Option<CandidateStats> {
        let inner = self.inner.lock().expect("balancer lock");
        inner.indexers.get(&id).map(|r| r.stats(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foliofox_model::IndexerType;

    fn indexer(id: i64, priority: u8) -> Indexer {
        Indexer {
            id: IndexerId(id),
            name: format!("ix-{id}"),
            indexer_type: IndexerType::Generic,
            base_url: "http://127.0.0.1:1".to_string(),
            api_key: None,
            priority,
            active: true,
            timeout_ms: 1_000,
            rate_limit_per_window: 10,
            window_ms: 60_000,
        }
    }

    fn balancer(strategy: FailoverStrategy) -> Balancer {
        Balancer::new(BalancerConfig {
            strategy,
            breaker: BreakerConfig {
                failure_threshold: 3,
                recovery_timeout: chrono::Duration::seconds(60),
            },
            weights: ScoreWeights::default(),
        })
    }

    #[test]
    fn test_select_skips_open_breakers() {
        let balancer = balancer(FailoverStrategy::Priority);
        balancer.sync_indexers(&[indexer(1, 1), indexer(2, 5)]);
        let now = Utc::now();
        for _ in 0..3 {
            balancer.record_result(IndexerId(1), false, None, now);
        }
        assert_eq!(balancer.breaker_state(IndexerId(1)), Some(BreakerState::Open));
        assert_eq!(balancer.select_target(now), Some(IndexerId(2)));
    }

    #[test]
    fn test_select_with_no_indexers_is_none() {
        let balancer = balancer(FailoverStrategy::Intelligent);
        assert_eq!(balancer.select_target(Utc::now()), None);
    }

    #[test]
    fn test_failover_verifies_on_target_success() {
        let balancer = balancer(FailoverStrategy::Priority);
        balancer.sync_indexers(&[indexer(1, 1), indexer(2, 5)]);
        let now = Utc::now();

        let event = balancer.begin_failover(IndexerId(1), "breaker open", now);
        assert_eq!(event.to_id, Some(IndexerId(2)));
        assert!(!event.verified);

        // Nothing verified until the *target* succeeds.
        assert!(
            balancer
                .record_result(IndexerId(1), true, Some(10), now)
                .is_empty()
        );
        let verified = balancer.record_result(IndexerId(2), true, Some(10), now);
        assert_eq!(verified.len(), 1);
        assert!(verified[0].verified);
    }

    #[test]
    fn test_failover_with_no_alternative_has_no_target() {
        let balancer = balancer(FailoverStrategy::Priority);
        balancer.sync_indexers(&[indexer(1, 1)]);
        let event = balancer.begin_failover(IndexerId(1), "down", Utc::now());
        assert_eq!(event.to_id, None);
    }
}
