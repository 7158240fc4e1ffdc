//! HTTP health probes, one contract per backend type.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::Instant;
use tracing::debug;

use foliofox_model::{Indexer, IndexerType};

use crate::error::Result;

/// Outcome of one probe round-trip.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

/// Shared probe clients, one per backend type so connection pools and
/// redirect policies stay separate.
#[derive(Debug, Clone)]
pub struct ProbeClient {
    api: reqwest::Client,
    // Generic probes must see 301/302 themselves instead of following them.
    raw: reqwest::Client,
    default_timeout: Duration,
}

impl ProbeClient {
    pub fn new(default_timeout: Duration) -> Result<Self> {
        let api = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .timeout(default_timeout)
            .build()?;
        let raw = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(default_timeout)
            .build()?;
        Ok(Self {
            api,
            raw,
            default_timeout,
        })
    }

    fn timeout_for(&self, indexer: &Indexer) -> Duration {
        if indexer.timeout_ms == 0 {
            return self.default_timeout;
        }
        Duration::from_millis(indexer.timeout_ms)
    }

    /// Run the backend-specific probe sequence and time it end to end.
    pub async fn probe(&self, indexer: &Indexer) -> ProbeOutcome {
        let started = Instant::now();
        let result = match indexer.indexer_type {
            IndexerType::Prowlarr => self.probe_prowlarr(indexer).await,
            IndexerType::Jackett => self.probe_jackett(indexer).await,
            IndexerType::Generic => self.probe_generic(indexer).await,
        };
        let response_time_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => ProbeOutcome {
                ok: true,
                response_time_ms,
                error: None,
            },
            Err(message) => {
                debug!(indexer = %indexer.name, %message, "probe failed");
                ProbeOutcome {
                    ok: false,
                    response_time_ms,
                    error: Some(message),
                }
            }
        }
    }

    async fn probe_prowlarr(&self, indexer: &Indexer) -> std::result::Result<(), String> {
        let api_key = indexer
            .api_key
            .as_deref()
            .ok_or_else(|| "prowlarr probe requires an api key".to_string())?;
        for path in ["/api/v1/system/status", "/api/v1/indexer"] {
            let url = join_url(&indexer.base_url, path);
            let response = self
                .api
                .get(&url)
                .header("X-Api-Key", api_key)
                .timeout(self.timeout_for(indexer))
                .send()
                .await
                .map_err(|e| e.to_string())?;
            expect_status(&url, response.status(), &[StatusCode::OK])?;
        }
        Ok(())
    }

    async fn probe_jackett(&self, indexer: &Indexer) -> std::result::Result<(), String> {
        let api_key = indexer
            .api_key
            .as_deref()
            .ok_or_else(|| "jackett probe requires an api key".to_string())?;
        for path in ["/api/v2.0/server/config", "/api/v2.0/indexers"] {
            let url = join_url(&indexer.base_url, path);
            let response = self
                .api
                .get(&url)
                .query(&[("apikey", api_key)])
                .timeout(self.timeout_for(indexer))
                .send()
                .await
                .map_err(|e| e.to_string())?;
            expect_status(&url, response.status(), &[StatusCode::OK])?;
        }
        // A no-op search proves the search pipeline, not just the UI.
        let url = join_url(&indexer.base_url, "/api/v2.0/indexers/all/results");
        let response = self
            .api
            .get(&url)
            .query(&[
                ("apikey", api_key),
                ("Query", "test"),
                ("Category", "8000"),
            ])
            .timeout(self.timeout_for(indexer))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        expect_status(&url, response.status(), &[StatusCode::OK])
    }

    async fn probe_generic(&self, indexer: &Indexer) -> std::result::Result<(), String> {
        let response = self
            .raw
            .get(&indexer.base_url)
            .timeout(self.timeout_for(indexer))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        expect_status(
            &indexer.base_url,
            response.status(),
            &[
                StatusCode::OK,
                StatusCode::MOVED_PERMANENTLY,
                StatusCode::FOUND,
            ],
        )
    }
}

fn expect_status(
    url: &str,
    status: StatusCode,
    accepted: &[StatusCode],
) -> std::result::Result<(), String> {
    if accepted.contains(&status) {
        Ok(())
    } else {
        Err(format!("{url} returned {status}"))
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}
