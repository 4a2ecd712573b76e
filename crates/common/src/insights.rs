//! Read-only risk and technical-indicator snapshots.
//!
//! The indicator service computes everything; these payloads are passed
//! through as opaque JSON.

use anyhow::{Context, Result};
use reqwest::Url;
use std::time::Duration;
use tracing::debug;

/// Query for `GET /risk`.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskQuery {
    pub ticker: Option<String>,
    /// Confidence level in `(0, 1)`.
    pub alpha: f64,
    pub days: u32,
}

impl Default for RiskQuery {
    fn default() -> Self {
        Self {
            ticker: None,
            alpha: 0.9,
            days: 1,
        }
    }
}

/// Query for `GET /technical`.
#[derive(Debug, Clone, PartialEq)]
pub struct TechnicalQuery {
    pub ticker: Option<String>,
    pub days: u32,
    pub alpha: f64,
}

impl Default for TechnicalQuery {
    fn default() -> Self {
        Self {
            ticker: None,
            days: 30,
            alpha: 0.9,
        }
    }
}

pub struct InsightsClient {
    base_url: String,
    client: reqwest::Client,
}

impl InsightsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn risk_url(&self, query: &RiskQuery) -> Result<String> {
        let mut url = Url::parse(&format!("{}/risk", self.base_url))?;
        {
            let mut qp = url.query_pairs_mut();
            if let Some(t) = query.ticker.as_deref().filter(|t| !t.is_empty()) {
                qp.append_pair("ticker", t);
            }
            qp.append_pair("alpha", &query.alpha.to_string());
            qp.append_pair("days", &query.days.to_string());
        }
        Ok(url.to_string())
    }

    pub fn technical_url(&self, query: &TechnicalQuery) -> Result<String> {
        let mut url = Url::parse(&format!("{}/technical", self.base_url))?;
        {
            let mut qp = url.query_pairs_mut();
            if let Some(t) = query.ticker.as_deref().filter(|t| !t.is_empty()) {
                qp.append_pair("ticker", t);
            }
            qp.append_pair("days", &query.days.to_string());
            qp.append_pair("alpha", &query.alpha.to_string());
        }
        Ok(url.to_string())
    }

    pub async fn fetch_risk(&self, query: &RiskQuery) -> Result<serde_json::Value> {
        let url = self.risk_url(query)?;
        self.fetch(&url).await
    }

    pub async fn fetch_technical(&self, query: &TechnicalQuery) -> Result<serde_json::Value> {
        let url = self.technical_url(query)?;
        self.fetch(&url).await
    }

    async fn fetch(&self, url: &str) -> Result<serde_json::Value> {
        debug!(url = %url, "fetching insights");
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await
            .with_context(|| format!("failed to fetch {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!(
                "HTTP {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            );
        }

        resp.json()
            .await
            .with_context(|| format!("failed to decode {url}"))
    }
}
