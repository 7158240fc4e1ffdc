//! Failure classification and the retry schedule.
//!
//! One formula for the whole system:
//! `min(max_delay, base · exp_base^retry_count · multiplier(reason))`
//! scaled by jitter in `[0.8, 1.2]`, with fixed overrides for rate limits
//! and server errors and an immediate retry for corrupted files.

use std::time::Duration;

use rand::Rng;

use foliofox_config::DownloadsConfig;

/// Classified reason a download failed, derived from the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Network,
    Timeout,
    ServerError,
    RateLimited,
    IndexerDown,
    FileCorrupted,
    DiskFull,
    PermissionError,
    Unknown,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Network => "network",
            FailureKind::Timeout => "timeout",
            FailureKind::ServerError => "server_error",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::IndexerDown => "indexer_down",
            FailureKind::FileCorrupted => "file_corrupted",
            FailureKind::DiskFull => "disk_full",
            FailureKind::PermissionError => "permission_error",
            FailureKind::Unknown => "unknown",
        }
    }

    /// Local-resource failures are surfaced to the operator, not retried.
    pub fn is_local_resource(self) -> bool {
        matches!(self, FailureKind::DiskFull | FailureKind::PermissionError)
    }

    fn multiplier(self) -> f64 {
        match self {
            FailureKind::Network => 1.5,
            FailureKind::Timeout => 1.2,
            FailureKind::ServerError => 2.0,
            FailureKind::RateLimited => 3.0,
            FailureKind::IndexerDown => 2.5,
            FailureKind::FileCorrupted
            | FailureKind::DiskFull
            | FailureKind::PermissionError
            | FailureKind::Unknown => 1.0,
        }
    }
}

/// Substring table, matched case-insensitively in declaration order.
const FAILURE_PATTERNS: &[(FailureKind, &[&str])] = &[
    (
        FailureKind::RateLimited,
        &["429", "rate limit", "too many requests", "quota exceeded"],
    ),
    (
        FailureKind::ServerError,
        &["500", "502", "503", "504", "internal server error", "bad gateway"],
    ),
    (
        FailureKind::Timeout,
        &["timeout", "deadline exceeded", "timed out"],
    ),
    (
        FailureKind::Network,
        &[
            "connection refused",
            "network unreachable",
            "dns lookup failed",
            "connection reset",
            "connection error",
        ],
    ),
    (
        FailureKind::IndexerDown,
        &["indexer unavailable", "indexer offline", "indexer maintenance"],
    ),
    (
        FailureKind::FileCorrupted,
        &["checksum mismatch", "corrupted file", "invalid file format", "size mismatch"],
    ),
    (
        FailureKind::DiskFull,
        &["no space left", "disk full", "insufficient space"],
    ),
    (
        FailureKind::PermissionError,
        &["permission denied", "access denied", "forbidden"],
    ),
];

/// Classify an error message by substring.
pub fn classify(error_message: &str) -> FailureKind {
    if error_message.is_empty() {
        return FailureKind::Unknown;
    }
    let lower = error_message.to_lowercase();
    for (kind, patterns) in FAILURE_PATTERNS {
        if patterns.iter().any(|p| lower.contains(p)) {
            return *kind;
        }
    }
    FailureKind::Unknown
}

/// Signals that mean the resource is gone for good; retrying cannot help.
const PERMANENT_SIGNALS: &[&str] = &["404", "not found", "removed", "deleted", "unavailable"];

pub fn is_permanent_failure(error_message: &str) -> bool {
    let lower = error_message.to_lowercase();
    PERMANENT_SIGNALS.iter().any(|s| lower.contains(s))
}

/// Per-indexer failure volume above which smart retry stops feeding it.
pub const INDEXER_FAILURE_CEILING: u64 = 5;

/// The smart-retry filter: skip a scheduled retry when the indexer is
/// failing broadly or the error is permanent.
pub fn should_skip_retry(
    error_message: &str,
    indexer_failures_last_hour: u64,
) -> bool {
    indexer_failures_last_hour >= INDEXER_FAILURE_CEILING
        || is_permanent_failure(error_message)
}

/// Backoff schedule shared by the scheduler and the eligibility query.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub exp_base: f64,
    pub max_delay: Duration,
    pub rate_limit_backoff: Duration,
    pub server_error_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            exp_base: 2.0,
            max_delay: Duration::from_secs(3_600),
            rate_limit_backoff: Duration::from_secs(300),
            server_error_backoff: Duration::from_secs(900),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadsConfig) -> Self {
        Self {
            base_delay: Duration::from_secs(config.retry_base_delay_seconds),
            exp_base: config.retry_exp_base,
            max_delay: Duration::from_secs(config.retry_max_delay_seconds),
            ..Self::default()
        }
    }

    /// Deterministic delay before the next attempt, pre-jitter.
    pub fn base_delay_for(&self, kind: FailureKind, retry_count: u32) -> Duration {
        match kind {
            FailureKind::RateLimited => self.rate_limit_backoff,
            FailureKind::ServerError => self.server_error_backoff,
            FailureKind::FileCorrupted => Duration::ZERO,
            _ => {
                let exp = self.exp_base.powi(retry_count.min(30) as i32);
                let seconds =
                    self.base_delay.as_secs_f64() * exp * kind.multiplier();
                Duration::from_secs_f64(seconds.min(self.max_delay.as_secs_f64()))
            }
        }
    }

    /// Delay with the ±20% jitter applied.
    pub fn delay(&self, kind: FailureKind, retry_count: u32) -> Duration {
        let base = self.base_delay_for(kind, retry_count);
        if base.is_zero() {
            return base;
        }
        let jitter = rand::rng().random_range(0.8..=1.2);
        Duration::from_secs_f64(base.as_secs_f64() * jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_substring() {
        assert_eq!(classify("HTTP 429 Too Many Requests"), FailureKind::RateLimited);
        assert_eq!(classify("502 Bad Gateway"), FailureKind::ServerError);
        assert_eq!(classify("request timed out"), FailureKind::Timeout);
        assert_eq!(classify("Connection reset by peer"), FailureKind::Network);
        assert_eq!(classify("size mismatch: got 10, want 20"), FailureKind::FileCorrupted);
        assert_eq!(classify("No space left on device"), FailureKind::DiskFull);
        assert_eq!(classify("Permission denied (os error 13)"), FailureKind::PermissionError);
        assert_eq!(classify("indexer offline for upgrades"), FailureKind::IndexerDown);
        assert_eq!(classify("mystery"), FailureKind::Unknown);
        assert_eq!(classify(""), FailureKind::Unknown);
    }

    #[test]
    fn test_fixed_backoffs() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.base_delay_for(FailureKind::RateLimited, 0),
            Duration::from_secs(300)
        );
        assert_eq!(
            policy.base_delay_for(FailureKind::ServerError, 4),
            Duration::from_secs(900)
        );
        assert_eq!(
            policy.base_delay_for(FailureKind::FileCorrupted, 2),
            Duration::ZERO
        );
    }

    #[test]
    fn test_delay_monotone_per_reason() {
        let policy = RetryPolicy::default();
        for kind in [FailureKind::Network, FailureKind::Timeout, FailureKind::Unknown] {
            let mut previous = Duration::ZERO;
            for retry in 0..6 {
                let delay = policy.base_delay_for(kind, retry);
                assert!(delay >= previous, "{kind:?} retry {retry}");
                previous = delay;
            }
        }
    }

    #[test]
    fn test_delay_caps_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.base_delay_for(FailureKind::Network, 20),
            Duration::from_secs(3_600)
        );
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let policy = RetryPolicy::default();
        let base = policy.base_delay_for(FailureKind::Network, 1);
        for _ in 0..100 {
            let jittered = policy.delay(FailureKind::Network, 1);
            assert!(jittered >= base.mul_f64(0.8));
            assert!(jittered <= base.mul_f64(1.2));
        }
    }

    #[test]
    fn test_permanent_signals() {
        assert!(is_permanent_failure("HTTP 404"));
        assert!(is_permanent_failure("file was removed by uploader"));
        assert!(!is_permanent_failure("connection reset"));
        assert!(should_skip_retry("ok-ish error", 5));
        assert!(!should_skip_retry("connection reset", 4));
    }
}
