//! Mock substitution for an unreachable backend.
//!
//! [`FallbackGateway`] wraps any [`Gateway`]. When enabled, a failed call is
//! logged at WARN, counted in `gateway_fallbacks_total`, and answered with
//! deterministic mock data tagged [`Fetched::Fallback`]. When disabled the
//! error passes through untouched.
//!
//! Status checks are only substituted for jobs that were themselves mocked.
//! A job the live backend accepted keeps its real errors so the poller can
//! retry them.

use crate::gateway::{Fetched, Gateway, GatewayResult, ReportQuery};
use crate::types::{
    Job, JobStatus, PublishReceipt, PublishRequest, Report, ReportPage, ReportSummary, Risk,
    RiskLabel, Severity, SubmitResponse, VaeMetrics,
};
use std::collections::BTreeMap;
use tracing::warn;

pub const MOCK_REPORT_CID: &str = "mock-report-cid";
pub const MOCK_TX_HASH: &str = "0xMOCKTXHASH";
const MOCK_JOB_PREFIX: &str = "mock-job-";
const MOCK_REPORT_TOTAL: u64 = 37;

pub struct FallbackGateway<G> {
    inner: G,
    enabled: bool,
}

impl<G: Gateway> FallbackGateway<G> {
    pub fn new(inner: G, enabled: bool) -> Self {
        Self { inner, enabled }
    }

    fn substitute<T>(
        &self,
        op: &'static str,
        result: GatewayResult<T>,
        mock: impl FnOnce() -> T,
    ) -> GatewayResult<T> {
        match result {
            Err(e) if self.enabled => {
                warn!(op, error = %e, "backend unavailable, substituting mock response");
                metrics::counter!("gateway_fallbacks_total", "op" => op).increment(1);
                Ok(Fetched::Fallback(mock()))
            }
            other => other,
        }
    }
}

impl<G: Gateway> Gateway for FallbackGateway<G> {
    async fn submit_job(&self, subject_id: &str, chain_id: u64) -> GatewayResult<SubmitResponse> {
        let res = self.inner.submit_job(subject_id, chain_id).await;
        self.substitute("submit_job", res, || mock_submit(subject_id, chain_id))
    }

    async fn get_job_status(&self, job_id: &str) -> GatewayResult<Job> {
        let res = self.inner.get_job_status(job_id).await;
        if !is_mock_job(job_id) {
            return res;
        }
        self.substitute("get_job_status", res, || mock_job(job_id))
    }

    async fn get_report(&self, report_id: &str) -> GatewayResult<Report> {
        let res = self.inner.get_report(report_id).await;
        self.substitute("get_report", res, || mock_report(report_id))
    }

    async fn publish_report(&self, request: &PublishRequest) -> GatewayResult<PublishReceipt> {
        let res = self.inner.publish_report(request).await;
        self.substitute("publish_report", res, mock_publish)
    }

    async fn list_reports(&self, query: &ReportQuery) -> GatewayResult<ReportPage> {
        let res = self.inner.list_reports(query).await;
        self.substitute("list_reports", res, || mock_report_page(query))
    }
}

/// Whether `job_id` was handed out by [`mock_submit`].
pub fn is_mock_job(job_id: &str) -> bool {
    job_id.starts_with(MOCK_JOB_PREFIX)
}

pub fn mock_submit(subject_id: &str, chain_id: u64) -> SubmitResponse {
    let short: String = subject_id
        .trim_start_matches("0x")
        .chars()
        .take(8)
        .collect::<String>()
        .to_ascii_lowercase();
    SubmitResponse {
        job_id: format!("{MOCK_JOB_PREFIX}{chain_id}-{short}"),
    }
}

/// A finished job pointing at [`MOCK_REPORT_CID`].
pub fn mock_job(job_id: &str) -> Job {
    let progress = BTreeMap::from([
        ("fundamentals".to_string(), 0.88),
        ("microstructure".to_string(), 0.72),
        ("sentiment".to_string(), 0.45),
        ("technical".to_string(), 0.60),
    ]);
    Job {
        id: job_id.to_string(),
        status: JobStatus::Done,
        progress,
        report_id: Some(MOCK_REPORT_CID.to_string()),
        error: None,
    }
}

pub fn mock_report(cid: &str) -> Report {
    let pillars = BTreeMap::from([
        ("fundamentals".to_string(), 65.0),
        ("microstructure".to_string(), 70.0),
        ("sentiment".to_string(), 50.0),
        ("technical".to_string(), 55.0),
    ]);
    let risk = |id: &str, title: &str, severity, detail: &str| Risk {
        id: id.to_string(),
        title: title.to_string(),
        severity,
        detail: Some(detail.to_string()),
    };
    Report {
        id: cid.to_string(),
        token: Some("0xMockTokenAddress".to_string()),
        score: 62.0,
        label: Some(RiskLabel::Yellow),
        pillars,
        top_risks: vec![
            risk(
                "1",
                "Owner can mint tokens",
                Severity::High,
                "Owner-controlled mint function present.",
            ),
            risk(
                "2",
                "High holder concentration",
                Severity::Medium,
                "Top holders control >40% supply.",
            ),
            risk(
                "3",
                "Thin liquidity in major pools",
                Severity::Medium,
                "Low depth in main DEX pool.",
            ),
        ],
        chart_data: None,
        vae: Some(VaeMetrics {
            var_95: -0.28,
            var_99: -0.45,
            es_95: -0.32,
        }),
        signature: Some("0xMOCKSIGNATURE".to_string()),
        generated_at: None,
    }
}

pub fn mock_publish() -> PublishReceipt {
    PublishReceipt {
        tx_hash: MOCK_TX_HASH.to_string(),
        explorer_url: Some("#".to_string()),
    }
}

pub fn mock_report_page(query: &ReportQuery) -> ReportPage {
    const RISK_LEVELS: [&str; 3] = ["Low", "Medium", "High"];

    let remaining = MOCK_REPORT_TOTAL.saturating_sub(u64::from(query.offset));
    let count = remaining.min(u64::from(query.limit));
    let items = (0..count)
        .map(|i| {
            let idx = u64::from(query.offset) + i + 1;
            ReportSummary {
                cid: format!("mock-report-{idx}"),
                title: format!("Mock Report #{idx}"),
                snippet: format!(
                    "Score {} \u{2022} {} risk",
                    50 + (idx * 7) % 40,
                    RISK_LEVELS[(idx % 3) as usize]
                ),
            }
        })
        .collect();
    ReportPage {
        total: MOCK_REPORT_TOTAL,
        items,
    }
}
