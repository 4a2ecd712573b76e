use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Message stored on a failed job when the backend does not supply one.
pub const DEFAULT_JOB_FAILURE: &str = "Job failed";

/// Analysis pillars the backend reports progress and scores for, in display order.
pub const PILLARS: [&str; 4] = ["fundamentals", "microstructure", "sentiment", "technical"];

/// Backend-side job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Submitted,
    Running,
    Done,
    Failed,
    /// Any status string this client does not know. Treated as non-terminal.
    #[serde(other)]
    Other,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Other => "other",
        }
    }
}

/// A server-side analysis job as returned by `GET /jobs/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: String,
    pub status: JobStatus,
    /// Per-pillar completion in `[0, 1]`.
    #[serde(default)]
    pub progress: BTreeMap<String, f64>,
    #[serde(
        rename = "reportCid",
        alias = "reportId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub report_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The single terminal outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome<'a> {
    Completed { report_id: &'a str },
    Failed { error: &'a str },
}

impl Job {
    /// Placeholder recorded right after submission, before the first status fetch.
    pub fn submitted(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Submitted,
            progress: BTreeMap::new(),
            report_id: None,
            error: None,
        }
    }

    /// `done` only counts as terminal once the backend names the report.
    pub fn outcome(&self) -> Option<JobOutcome<'_>> {
        match self.status {
            JobStatus::Done => self
                .report_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .map(|report_id| JobOutcome::Completed { report_id }),
            JobStatus::Failed => Some(JobOutcome::Failed {
                error: self
                    .error
                    .as_deref()
                    .filter(|e| !e.is_empty())
                    .unwrap_or(DEFAULT_JOB_FAILURE),
            }),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }

    /// Whole-percent progress for a pillar, clamped to `0..=100`. Missing pillars read as 0.
    pub fn progress_pct(&self, pillar: &str) -> u8 {
        let v = self.progress.get(pillar).copied().unwrap_or(0.0);
        if !v.is_finite() {
            return 0;
        }
        (v * 100.0).round().clamp(0.0, 100.0) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    #[serde(rename = "jobId")]
    pub job_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLabel {
    #[serde(alias = "green", alias = "GREEN")]
    Green,
    #[serde(alias = "yellow", alias = "YELLOW")]
    Yellow,
    #[serde(alias = "red", alias = "RED")]
    Red,
}

impl RiskLabel {
    /// Score bands: 70 and above is green, 40 and above yellow, red below.
    pub fn from_score(score: f64) -> Self {
        if score >= 70.0 {
            Self::Green
        } else if score >= 40.0 {
            Self::Yellow
        } else {
            Self::Red
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "Green",
            Self::Yellow => "Yellow",
            Self::Red => "Red",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Risk {
    #[serde(deserialize_with = "de_string_any")]
    pub id: String,
    pub title: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Tail-risk figures from the volatility model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VaeMetrics {
    #[serde(rename = "VaR95")]
    pub var_95: f64,
    #[serde(rename = "VaR99")]
    pub var_99: f64,
    #[serde(rename = "ES95")]
    pub es_95: f64,
}

/// Finished analysis, addressed by content identifier.
///
/// Reports are immutable once fetched. A refresh replaces the value wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(rename = "cid", alias = "id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<RiskLabel>,
    #[serde(default)]
    pub pillars: BTreeMap<String, f64>,
    #[serde(rename = "topRisks", default)]
    pub top_risks: Vec<Risk>,
    /// Chart payload passed through untouched.
    #[serde(rename = "chartData", default, skip_serializing_if = "Option::is_none")]
    pub chart_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vae: Option<VaeMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(rename = "generatedAt", default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
}

impl Report {
    /// Backend label when present, otherwise derived from the score.
    pub fn label(&self) -> RiskLabel {
        self.label
            .unwrap_or_else(|| RiskLabel::from_score(self.score))
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.top_risks.iter().map(|r| r.severity).max()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    #[serde(rename = "txHash")]
    pub tx_hash: String,
    #[serde(rename = "explorerUrl", default, skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub cid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
}

/// One page of `GET /reports`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPage {
    pub total: u64,
    #[serde(default)]
    pub items: Vec<ReportSummary>,
}

impl ReportPage {
    pub fn total_pages(&self, limit: u32) -> u64 {
        if limit == 0 {
            return 1;
        }
        self.total.div_ceil(u64::from(limit)).max(1)
    }
}

fn de_string_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct StringOrNumber;

    impl de::Visitor<'_> for StringOrNumber {
        type Value = String;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a string or number")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(v.to_string())
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(v.to_string())
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v.to_string())
        }
    }

    deserializer.deserialize_any(StringOrNumber)
}
