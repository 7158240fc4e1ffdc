//! Target selection over the healthy subset of indexers.

use foliofox_model::{HealthStatus, IndexerId};

pub use foliofox_config::FailoverStrategy;

/// Live per-indexer statistics the selector scores against.
#[derive(Debug, Clone)]
pub struct CandidateStats {
    pub indexer_id: IndexerId,
    /// Stored priority, 1 most preferred.
    pub priority: u8,
    pub status: HealthStatus,
    pub last_response_time_ms: Option<u64>,
    pub success_count: u64,
    pub failure_count: u64,
    /// In-process requests routed to this indexer so far.
    pub request_count: u64,
    pub consecutive_failures: u32,
}

impl CandidateStats {
    /// Percentage of successful requests; optimistic 100 with no history.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 100.0;
        }
        self.success_count as f64 / total as f64 * 100.0
    }
}

/// Weights for the `intelligent` strategy's composite score.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub response_time: f64,
    pub success_rate: f64,
    pub load: f64,
    pub priority: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            response_time: 1.0,
            success_rate: 1.0,
            load: 1.0,
            priority: 1.0,
        }
    }
}

/// Composite cost of routing to one candidate; lower wins.
pub fn intelligent_score(candidate: &CandidateStats, weights: ScoreWeights) -> f64 {
    let penalty = match candidate.status {
        HealthStatus::Down => return f64::INFINITY,
        HealthStatus::Degraded => 500.0,
        _ => 0.0,
    } + 100.0 * candidate.consecutive_failures as f64;

    let response_time = candidate
        .last_response_time_ms
        .map(|ms| ms as f64)
        .unwrap_or(0.0);

    weights.response_time * response_time
        + weights.success_rate * (100.0 - candidate.success_rate()) * 10.0
        + weights.load * candidate.request_count as f64 * 10.0
        + weights.priority * candidate.priority as f64 * 50.0
        + penalty
}

/// Pick a target among candidates whose breaker already allowed the call.
/// `round_robin_cursor` is the caller-owned monotonic counter.
pub fn select(
    strategy: FailoverStrategy,
    candidates: &[CandidateStats],
    round_robin_cursor: &mut usize,
    weights: ScoreWeights,
) -> Option<IndexerId> {
    if candidates.is_empty() {
        return None;
    }
    match strategy {
        FailoverStrategy::RoundRobin => {
            let index = *round_robin_cursor % candidates.len();
            *round_robin_cursor = round_robin_cursor.wrapping_add(1);
            Some(candidates[index].indexer_id)
        }
        FailoverStrategy::Priority => candidates
            .iter()
            .min_by_key(|c| (c.priority, c.indexer_id))
            .map(|c| c.indexer_id),
        FailoverStrategy::ResponseTime => candidates
            .iter()
            .min_by_key(|c| {
                (
                    c.last_response_time_ms.unwrap_or(u64::MAX),
                    c.indexer_id,
                )
            })
            .map(|c| c.indexer_id),
        FailoverStrategy::LoadBalanced => candidates
            .iter()
            .min_by_key(|c| (c.request_count, c.indexer_id))
            .map(|c| c.indexer_id),
        FailoverStrategy::Intelligent => {
            let mut best: Option<(f64, IndexerId)> = None;
            for candidate in candidates {
                let score = intelligent_score(candidate, weights);
                if !score.is_finite() {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((best_score, best_id)) => {
                        score < best_score
                            || (score == best_score && candidate.indexer_id < best_id)
                    }
                };
                if better {
                    best = Some((score, candidate.indexer_id));
                }
            }
            best.map(|(_, id)| id)
        }
    }
}
