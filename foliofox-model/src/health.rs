use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::ids::IndexerId;

/// Classified condition of one indexer backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
    Maintenance,
    Recovering,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
            HealthStatus::Maintenance => "maintenance",
            HealthStatus::Recovering => "recovering",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "healthy" => Ok(HealthStatus::Healthy),
            "degraded" => Ok(HealthStatus::Degraded),
            "down" => Ok(HealthStatus::Down),
            "maintenance" => Ok(HealthStatus::Maintenance),
            "recovering" => Ok(HealthStatus::Recovering),
            other => Err(ModelError::UnknownVariant(
                "health status",
                other.to_string(),
            )),
        }
    }

    /// Whether a balancer may route new requests at this status.
    pub fn accepts_traffic(self) -> bool {
        matches!(
            self,
            HealthStatus::Healthy | HealthStatus::Degraded | HealthStatus::Recovering
        )
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One probe outcome, appended to `indexer_health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub indexer_id: IndexerId,
    pub status: HealthStatus,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Record that traffic intended for one indexer was redirected to another.
///
/// `verified` stays false until a request through the selected target
/// succeeds; emission alone proves nothing about the new target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub from_id: IndexerId,
    pub to_id: Option<IndexerId>,
    pub reason: String,
    pub verified: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Record that a previously failed indexer passed its confirmation re-probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub indexer_id: IndexerId,
    pub downtime_seconds: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            HealthStatus::Healthy,
            HealthStatus::Degraded,
            HealthStatus::Down,
            HealthStatus::Maintenance,
            HealthStatus::Recovering,
        ] {
            assert_eq!(HealthStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_down_and_maintenance_refuse_traffic() {
        assert!(!HealthStatus::Down.accepts_traffic());
        assert!(!HealthStatus::Maintenance.accepts_traffic());
        assert!(HealthStatus::Recovering.accepts_traffic());
    }
}
