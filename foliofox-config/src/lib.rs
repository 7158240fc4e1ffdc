//! Typed configuration for the FolioFox core.
//!
//! The outer application owns the configuration file format and CLI; this
//! crate only defines the typed sections the core consumes and a loader
//! that merges an optional file with `FOLIOFOX_`-prefixed environment
//! overrides. Every field has a serde default so a missing section falls
//! back to documented behaviour.

pub mod models;

use std::path::Path;

use thiserror::Error;

pub use models::{
    BackupConfig, Config, DatabaseConfig, DedupConfig, DownloadsConfig,
    FailoverConfig, FailoverStrategy, MaintenanceConfig, MonitoringConfig,
    ResourceThresholds,
};

/// Errors raised while assembling a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Load configuration from an optional file plus environment overrides.
///
/// Environment keys use `__` as the section separator, e.g.
/// `FOLIOFOX_DOWNLOADS__MAX_CONCURRENT=5`.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(
            config::File::from(path.to_path_buf()).required(true),
        );
    }
    let settings = builder
        .add_source(
            config::Environment::with_prefix("FOLIOFOX").separator("__"),
        )
        .build()?;
    Ok(settings.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file_or_env() {
        let config = load(None).expect("default config");
        assert_eq!(config.downloads.max_concurrent, 3);
        assert_eq!(config.failover.failure_threshold, 5);
        assert_eq!(config.maintenance.auto_vacuum_threshold_mb, 100);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("foliofox.toml");
        std::fs::write(
            &path,
            "[downloads]\nmax_concurrent = 8\n[failover]\nstrategy = \"priority\"\n",
        )
        .expect("write config");

        let config = load(Some(&path)).expect("load config");
        assert_eq!(config.downloads.max_concurrent, 8);
        assert_eq!(config.failover.strategy, FailoverStrategy::Priority);
        // Untouched sections keep their defaults.
        assert_eq!(config.downloads.retry_count, 3);
    }
}
