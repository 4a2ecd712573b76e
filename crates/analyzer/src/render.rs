//! Plain-text views of poller snapshots, reports and history rows.

use crate::poller::{PollerStatus, Snapshot};
use common::db::{AnalysisRecord, Outcome};
use common::gateway::ReportQuery;
use common::types::{Job, PublishReceipt, Report, ReportPage, PILLARS};
use std::fmt::Write as _;

const BAR_WIDTH: usize = 20;

pub const FALLBACK_NOTICE: &str = "note: backend unreachable, showing mock data";

/// One line summarizing the snapshot. Safe for every state.
pub fn status_line(snapshot: &Snapshot) -> String {
    let mut line = match snapshot.status {
        PollerStatus::Idle => "idle: no analysis running".to_string(),
        PollerStatus::Running => match &snapshot.job {
            None => "running: submitting analysis".to_string(),
            Some(job) => {
                let pillars = PILLARS
                    .iter()
                    .map(|p| format!("{p} {}%", job.progress_pct(p)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("running: job {} {} ({pillars})", job.id, job.status.as_str())
            }
        },
        PollerStatus::Done => match &snapshot.report {
            Some(report) => format!(
                "done: score {:.0}/100 {}",
                report.score,
                report.label().as_str()
            ),
            None => "done".to_string(),
        },
        PollerStatus::Error => format!(
            "error: {}",
            snapshot.error.as_deref().unwrap_or("unknown error")
        ),
    };
    if let Some(warning) = &snapshot.warning {
        let _ = write!(line, " [warning: {warning}]");
    }
    line
}

fn progress_bar(fraction: f64) -> String {
    let filled = (fraction.clamp(0.0, 1.0) * BAR_WIDTH as f64).round() as usize;
    format!("[{}{}]", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
}

fn render_progress(out: &mut String, job: &Job) {
    let _ = writeln!(out, "Job {} ({})", job.id, job.status.as_str());
    for pillar in PILLARS {
        let fraction = job.progress.get(pillar).copied().unwrap_or(0.0);
        let _ = writeln!(
            out,
            "  {pillar:<15} {} {:>3}%",
            progress_bar(fraction),
            job.progress_pct(pillar)
        );
    }
}

/// Full view of the four user-visible states.
pub fn render_snapshot(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    if let Some(subject) = &snapshot.subject {
        let _ = writeln!(out, "Token {} on chain {}", subject.id, subject.chain_id);
    }
    match snapshot.status {
        PollerStatus::Idle => out.push_str("No analysis started.\n"),
        PollerStatus::Running => match &snapshot.job {
            Some(job) => render_progress(&mut out, job),
            None => out.push_str("Submitting analysis...\n"),
        },
        PollerStatus::Done => match &snapshot.report {
            Some(report) => out.push_str(&render_report(report)),
            None => out.push_str("Analysis finished.\n"),
        },
        PollerStatus::Error => {
            let _ = writeln!(
                out,
                "Analysis failed: {}",
                snapshot.error.as_deref().unwrap_or("unknown error")
            );
            if let Some(report_id) = snapshot.job.as_ref().and_then(|j| j.report_id.as_deref()) {
                let _ = writeln!(out, "Report {report_id} can be fetched again with `analyzer report {report_id}`.");
            }
        }
    }
    if let Some(warning) = &snapshot.warning {
        let _ = writeln!(out, "warning: {warning}");
    }
    if snapshot.used_fallback {
        let _ = writeln!(out, "{FALLBACK_NOTICE}");
    }
    out
}

pub fn render_report(report: &Report) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Report {}", report.id);
    if let Some(token) = &report.token {
        let _ = writeln!(out, "  token:  {token}");
    }
    let _ = writeln!(
        out,
        "  score:  {:.0}/100 ({})",
        report.score,
        report.label().as_str()
    );
    if let Some(at) = &report.generated_at {
        let _ = writeln!(out, "  generated at: {at}");
    }

    if !report.pillars.is_empty() {
        out.push_str("Pillars:\n");
        for (name, score) in &report.pillars {
            let _ = writeln!(out, "  {name:<15} {score:>5.1}");
        }
    }

    if let Some(highest) = report.highest_severity() {
        let _ = writeln!(out, "Top risks (highest: {}):", highest.as_str());
        for risk in &report.top_risks {
            let _ = write!(out, "  [{:<6}] {}", risk.severity.as_str(), risk.title);
            match &risk.detail {
                Some(detail) => {
                    let _ = writeln!(out, " - {detail}");
                }
                None => out.push('\n'),
            }
        }
    }

    if let Some(vae) = &report.vae {
        let _ = writeln!(
            out,
            "Volatility: VaR95 {:.2}  VaR99 {:.2}  ES95 {:.2}",
            vae.var_95, vae.var_99, vae.es_95
        );
    }
    if let Some(signature) = &report.signature {
        let _ = writeln!(out, "Signature: {signature}");
    }
    out
}

pub fn render_report_page(page: &ReportPage, query: &ReportQuery) -> String {
    let mut out = String::new();
    let page_no = if query.limit == 0 {
        1
    } else {
        u64::from(query.offset / query.limit) + 1
    };
    let _ = writeln!(
        out,
        "Reports: {} total, page {page_no} of {}",
        page.total,
        page.total_pages(query.limit).max(1)
    );
    if page.items.is_empty() {
        out.push_str("  (none)\n");
    }
    for item in &page.items {
        let _ = writeln!(out, "  {:<24} {}", item.cid, item.title);
        if !item.snippet.is_empty() {
            let _ = writeln!(out, "  {:<24} {}", "", item.snippet);
        }
    }
    out
}

pub fn render_receipt(receipt: &PublishReceipt) -> String {
    match &receipt.explorer_url {
        Some(url) => format!("Published: tx {} ({url})\n", receipt.tx_hash),
        None => format!("Published: tx {}\n", receipt.tx_hash),
    }
}

pub fn render_history(records: &[AnalysisRecord]) -> String {
    if records.is_empty() {
        return "No analyses recorded yet.\n".to_string();
    }
    let mut out = String::new();
    for r in records {
        let result = match r.outcome {
            Outcome::Done => match (r.score, r.label) {
                (Some(score), Some(label)) => format!("{score:.0} {}", label.as_str()),
                (Some(score), None) => format!("{score:.0}"),
                _ => "done".to_string(),
            },
            Outcome::Error => format!("error: {}", r.error.as_deref().unwrap_or("unknown")),
        };
        let mock = if r.used_fallback { " (mock)" } else { "" };
        let _ = writeln!(
            out,
            "{}  chain {:<5} {}  {result}{mock}",
            r.finished_at, r.chain_id, r.subject
        );
    }
    out
}
