use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::ids::IndexerId;

/// Kind of search backend behind an indexer row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexerType {
    Prowlarr,
    Jackett,
    Generic,
}

impl IndexerType {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexerType::Prowlarr => "prowlarr",
            IndexerType::Jackett => "jackett",
            IndexerType::Generic => "generic",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "prowlarr" => Ok(IndexerType::Prowlarr),
            "jackett" => Ok(IndexerType::Jackett),
            "generic" => Ok(IndexerType::Generic),
            other => Err(ModelError::UnknownVariant(
                "indexer type",
                other.to_string(),
            )),
        }
    }
}

impl std::fmt::Display for IndexerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured search backend. Created by the operator, mutated rarely.
///
/// Deletion is forbidden while any `download_queue` row references it; the
/// catalog enforces that with a foreign key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indexer {
    pub id: IndexerId,
    pub name: String,
    pub indexer_type: IndexerType,
    pub base_url: String,
    pub api_key: Option<String>,
    /// 1 is the most preferred, 10 the least.
    pub priority: u8,
    pub active: bool,
    pub timeout_ms: u64,
    pub rate_limit_per_window: u32,
    pub window_ms: u64,
}

impl Indexer {
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.priority) {
            return Err(ModelError::InvalidField(
                "priority",
                format!("{} outside [1..10]", self.priority),
            ));
        }
        if self.base_url.trim().is_empty() {
            return Err(ModelError::InvalidField(
                "base_url",
                "must be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_round_trips_through_str() {
        for ty in [
            IndexerType::Prowlarr,
            IndexerType::Jackett,
            IndexerType::Generic,
        ] {
            assert_eq!(IndexerType::parse(ty.as_str()).unwrap(), ty);
        }
        assert!(IndexerType::parse("gopher").is_err());
    }
}
