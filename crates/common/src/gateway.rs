//! HTTP client for the analysis backend.
//!
//! Every call returns [`Fetched`] so callers can tell real backend data from
//! substituted mock data (see [`crate::fallback`]).

use crate::types::{Job, PublishReceipt, PublishRequest, Report, ReportPage, SubmitResponse};
use anyhow::Context;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    /// Non-2xx response. `message` is the response body, or `bad response: <code>` when empty.
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid url: {0}")]
    Url(String),
}

/// Where a gateway value came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    Live(T),
    /// Deterministic mock data substituted for a failed call.
    Fallback(T),
}

impl<T> Fetched<T> {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }

    pub fn get(&self) -> &T {
        match self {
            Self::Live(v) | Self::Fallback(v) => v,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Live(v) | Self::Fallback(v) => v,
        }
    }
}

pub type GatewayResult<T> = Result<Fetched<T>, GatewayError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportQuery {
    pub limit: u32,
    pub offset: u32,
    pub q: String,
}

impl Default for ReportQuery {
    fn default() -> Self {
        Self {
            limit: 20,
            offset: 0,
            q: String::new(),
        }
    }
}

/// Operations the analysis backend exposes.
///
/// `submit_job` and `publish_report` create server-side state; the rest are
/// idempotent and safe to repeat.
pub trait Gateway: Send + Sync {
    fn submit_job(
        &self,
        subject_id: &str,
        chain_id: u64,
    ) -> impl Future<Output = GatewayResult<SubmitResponse>> + Send;

    fn get_job_status(&self, job_id: &str) -> impl Future<Output = GatewayResult<Job>> + Send;

    fn get_report(&self, report_id: &str) -> impl Future<Output = GatewayResult<Report>> + Send;

    fn publish_report(
        &self,
        request: &PublishRequest,
    ) -> impl Future<Output = GatewayResult<PublishReceipt>> + Send;

    fn list_reports(
        &self,
        query: &ReportQuery,
    ) -> impl Future<Output = GatewayResult<ReportPage>> + Send;
}

#[derive(Serialize)]
struct AnalyzeBody<'a> {
    #[serde(rename = "tokenAddress")]
    token_address: &'a str,
    #[serde(rename = "chainId")]
    chain_id: u64,
}

pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn analyze_url(&self) -> String {
        format!("{}/analyze", self.base_url)
    }

    pub fn job_url(&self, job_id: &str) -> String {
        format!("{}/jobs/{}", self.base_url, urlencoding::encode(job_id))
    }

    pub fn report_url(&self, cid: &str) -> String {
        format!("{}/reports/{}", self.base_url, urlencoding::encode(cid))
    }

    pub fn publish_url(&self) -> String {
        format!("{}/publish", self.base_url)
    }

    pub fn reports_url(&self, query: &ReportQuery) -> Result<String, GatewayError> {
        let mut url = Url::parse(&format!("{}/reports", self.base_url))
            .map_err(|e| GatewayError::Url(format!("{}: {e}", self.base_url)))?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("limit", &query.limit.to_string());
            qp.append_pair("offset", &query.offset.to_string());
            qp.append_pair("q", &query.q);
        }
        Ok(url.to_string())
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<T, GatewayError> {
        debug!(url = %url, "gateway request");

        let network = |source| GatewayError::Network {
            url: url.to_string(),
            source,
        };
        let resp = request.send().await.map_err(network)?;
        let status = resp.status();
        let body = resp.text().await.map_err(network)?;

        if !status.is_success() {
            let message = if body.trim().is_empty() {
                format!("bad response: {}", status.as_u16())
            } else {
                body
            };
            return Err(GatewayError::Status {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&body).map_err(|source| GatewayError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

impl Gateway for HttpGateway {
    async fn submit_job(&self, subject_id: &str, chain_id: u64) -> GatewayResult<SubmitResponse> {
        let url = self.analyze_url();
        let body = AnalyzeBody {
            token_address: subject_id,
            chain_id,
        };
        let req = self.client.post(&url).json(&body);
        self.send_json(req, &url).await.map(Fetched::Live)
    }

    async fn get_job_status(&self, job_id: &str) -> GatewayResult<Job> {
        let url = self.job_url(job_id);
        let req = self.client.get(&url);
        let mut job: Job = self.send_json(req, &url).await?;
        if job.id.is_empty() {
            job.id = job_id.to_string();
        }
        Ok(Fetched::Live(job))
    }

    async fn get_report(&self, report_id: &str) -> GatewayResult<Report> {
        let url = self.report_url(report_id);
        let req = self.client.get(&url);
        self.send_json(req, &url).await.map(Fetched::Live)
    }

    async fn publish_report(&self, request: &PublishRequest) -> GatewayResult<PublishReceipt> {
        let url = self.publish_url();
        let req = self.client.post(&url).json(request);
        self.send_json(req, &url).await.map(Fetched::Live)
    }

    async fn list_reports(&self, query: &ReportQuery) -> GatewayResult<ReportPage> {
        let url = self.reports_url(query)?;
        let req = self.client.get(&url);
        self.send_json(req, &url).await.map(Fetched::Live)
    }
}
