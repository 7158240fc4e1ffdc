//! Sliding-window request caps per backend type.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

use foliofox_model::IndexerType;

/// One backend's cap: at most `limit` calls per `window`.
#[derive(Debug, Clone, Copy)]
pub struct WindowRule {
    pub limit: u32,
    pub window: Duration,
}

impl WindowRule {
    /// Default probe/search caps per backend type.
    pub fn for_backend(backend: IndexerType) -> Self {
        let limit = match backend {
            IndexerType::Prowlarr => 10,
            IndexerType::Jackett => 100,
            IndexerType::Generic => 10,
        };
        Self {
            limit,
            window: Duration::seconds(60),
        }
    }
}

/// Sliding-window log: keeps one timestamp per admitted call.
#[derive(Debug, Default)]
struct WindowLog {
    admitted: VecDeque<DateTime<Utc>>,
}

impl WindowLog {
    fn try_admit(&mut self, rule: WindowRule, now: DateTime<Utc>) -> Option<Duration> {
        let horizon = now - rule.window;
        while self
            .admitted
            .front()
            .is_some_and(|&at| at <= horizon)
        {
            self.admitted.pop_front();
        }
        if (self.admitted.len() as u32) < rule.limit {
            self.admitted.push_back(now);
            return None;
        }
        // Full: the caller may retry once the oldest admission expires.
        self.admitted
            .front()
            .map(|&oldest| (oldest + rule.window) - now)
    }
}

/// Rate limiter keyed by backend type, enforced over all probe traffic.
#[derive(Debug, Default)]
pub struct BackendRateLimits {
    windows: HashMap<IndexerType, WindowLog>,
}

impl BackendRateLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a call or return how long until the window frees a slot.
    pub fn try_admit(
        &mut self,
        backend: IndexerType,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let rule = WindowRule::for_backend(backend);
        self.windows
            .entry(backend)
            .or_default()
            .try_admit(rule, now)
    }
}
