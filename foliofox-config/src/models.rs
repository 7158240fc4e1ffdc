//! Configuration sections, one struct per concern.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration handed to the core at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub downloads: DownloadsConfig,
    pub failover: FailoverConfig,
    pub dedup: DedupConfig,
    pub maintenance: MaintenanceConfig,
    pub backup: BackupConfig,
    pub monitoring: MonitoringConfig,
}

/// Catalog store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite catalog file.
    pub path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/foliofox.db"),
            max_connections: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Download queue engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadsConfig {
    /// Concurrency cap for in-flight downloads.
    pub max_concurrent: usize,
    /// Token-bucket rate cap; absent means unthrottled.
    pub bandwidth_limit_mbps: Option<f64>,
    /// Default `max_retries` applied to new queue rows.
    pub retry_count: u32,
    /// Enable the failure-pattern retry filter.
    pub smart_retry: bool,
    pub download_dir: PathBuf,
    pub scheduler_tick_seconds: u64,
    /// A `downloading` row untouched for this long is considered stalled.
    pub stale_threshold_minutes: i64,
    pub download_timeout_seconds: u64,
    pub chunk_size_bytes: usize,
    /// Sleep between resource-pressure re-checks when throttled.
    pub throttle_interval_seconds: u64,
    pub retry_base_delay_seconds: u64,
    pub retry_exp_base: f64,
    pub retry_max_delay_seconds: u64,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            bandwidth_limit_mbps: None,
            retry_count: 3,
            smart_retry: true,
            download_dir: PathBuf::from("./downloads"),
            scheduler_tick_seconds: 10,
            stale_threshold_minutes: 60,
            download_timeout_seconds: 300,
            chunk_size_bytes: 8 * 1024,
            throttle_interval_seconds: 30,
            retry_base_delay_seconds: 60,
            retry_exp_base: 2.0,
            retry_max_delay_seconds: 3_600,
        }
    }
}

/// Target-selection strategy used by the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStrategy {
    RoundRobin,
    Priority,
    ResponseTime,
    LoadBalanced,
    Intelligent,
}

/// Indexer health and failover settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub health_check_interval_seconds: u64,
    /// Consecutive failures before the breaker trips.
    pub failure_threshold: u32,
    /// OPEN to HALF_OPEN wait.
    pub recovery_timeout_seconds: u64,
    pub strategy: FailoverStrategy,
    pub max_concurrent_checks: usize,
    /// Recovery re-probes allowed per indexer per rolling hour.
    pub max_recovery_attempts: u32,
    pub probe_timeout_seconds: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            health_check_interval_seconds: 30,
            failure_threshold: 5,
            recovery_timeout_seconds: 60,
            strategy: FailoverStrategy::Intelligent,
            max_concurrent_checks: 5,
            max_recovery_attempts: 5,
            probe_timeout_seconds: 30,
        }
    }
}

/// Duplicate detection thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub fuzzy_threshold: f64,
    pub title_similarity_threshold: f64,
    pub author_similarity_threshold: f64,
    /// Matches scoring below this are never auto-merged.
    pub manual_review_threshold: f64,
    pub similarity_cache_size: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.85,
            title_similarity_threshold: 0.9,
            author_similarity_threshold: 0.8,
            manual_review_threshold: 0.7,
            similarity_cache_size: 10_000,
        }
    }
}

/// Maintenance orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Vacuum only when the catalog file exceeds this size.
    pub auto_vacuum_threshold_mb: u64,
    /// Vacuum/reindex gate on `freelist_pages / page_count`.
    pub fragmentation_threshold_percent: f64,
    pub cleanup_retention_days: i64,
    /// Hours between scheduled full maintenance runs.
    pub full_run_interval_hours: u64,
    /// Application log directory rotated by the log-rotation task.
    pub log_dir: PathBuf,
    pub log_max_size_mb: u64,
    pub log_retention_days: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            auto_vacuum_threshold_mb: 100,
            fragmentation_threshold_percent: 25.0,
            cleanup_retention_days: 30,
            full_run_interval_hours: 24,
            log_dir: PathBuf::from("./logs"),
            log_max_size_mb: 50,
            log_retention_days: 14,
        }
    }
}

/// Backup settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub backup_dir: PathBuf,
    pub enable_compression: bool,
    /// Re-open the copy and run an integrity check after writing it.
    pub enable_verification: bool,
    pub retention_days: i64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("./backups"),
            enable_compression: true,
            enable_verification: true,
            retention_days: 30,
        }
    }
}

/// Resource thresholds that pause new download starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 85.0,
            memory_percent: 85.0,
            disk_percent: 90.0,
        }
    }
}

/// Monitoring settings consumed by the queue engine's throttle gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub resource_thresholds: ResourceThresholds,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_deserializes_snake_case() {
        let strategy: FailoverStrategy =
            serde_json::from_str("\"round_robin\"").expect("parse");
        assert_eq!(strategy, FailoverStrategy::RoundRobin);
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.downloads.scheduler_tick_seconds, 10);
        assert_eq!(config.downloads.chunk_size_bytes, 8 * 1024);
        assert_eq!(config.failover.recovery_timeout_seconds, 60);
        assert_eq!(config.dedup.fuzzy_threshold, 0.85);
        assert!(config.backup.enable_verification);
    }
}
