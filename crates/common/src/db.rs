//! Local history of finished analyses.

use anyhow::{Context, Result};
use rusqlite::OptionalExtension;
use std::time::Duration;

use crate::types::RiskLabel;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS analyses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL UNIQUE,
    subject TEXT NOT NULL,
    chain_id INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    report_cid TEXT,
    score REAL,
    label TEXT,
    error TEXT,
    used_fallback INTEGER NOT NULL DEFAULT 0,
    finished_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_analyses_finished_at ON analyses(finished_at);
CREATE INDEX IF NOT EXISTS idx_analyses_subject ON analyses(subject);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "done" {
            Self::Done
        } else {
            Self::Error
        }
    }
}

/// One finished analysis, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRecord {
    pub job_id: String,
    pub subject: String,
    pub chain_id: u64,
    pub outcome: Outcome,
    pub report_cid: Option<String>,
    pub score: Option<f64>,
    pub label: Option<RiskLabel>,
    pub error: Option<String>,
    pub used_fallback: bool,
    /// RFC 3339.
    pub finished_at: String,
}

fn parse_label(s: &str) -> Option<RiskLabel> {
    match s {
        "Green" => Some(RiskLabel::Green),
        "Yellow" => Some(RiskLabel::Yellow),
        "Red" => Some(RiskLabel::Red),
        _ => None,
    }
}

/// Async wrapper around `tokio_rusqlite::Connection`.
///
/// All SQLite work runs on a dedicated background thread. Clone is cheap.
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path` and run migrations on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .with_context(|| format!("failed to open history database: {path}"))?;

        conn.call(|conn| -> std::result::Result<(), rusqlite::Error> {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("AsyncDb::open: migration failed: {e}"))?;

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records latency and error metrics under `op`.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        let status = if res.is_ok() { "ok" } else { "err" };
        metrics::histogram!("history_db_query_latency_ms", "op" => op, "status" => status)
            .record(ms);
        if res.is_err() {
            metrics::counter!("history_db_query_errors_total", "op" => op).increment(1);
        }
        res
    }

    /// Insert a finished analysis. A second record for the same job replaces the first.
    pub async fn record_analysis(&self, record: AnalysisRecord) -> Result<()> {
        self.call_named("history.record_analysis", move |conn| {
            let chain_id = i64::try_from(record.chain_id).context("chain_id out of range")?;
            conn.execute(
                "INSERT INTO analyses
                    (job_id, subject, chain_id, outcome, report_cid, score, label, error, used_fallback, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(job_id) DO UPDATE SET
                    outcome = excluded.outcome,
                    report_cid = excluded.report_cid,
                    score = excluded.score,
                    label = excluded.label,
                    error = excluded.error,
                    used_fallback = excluded.used_fallback,
                    finished_at = excluded.finished_at",
                rusqlite::params![
                    record.job_id,
                    record.subject,
                    chain_id,
                    record.outcome.as_str(),
                    record.report_cid,
                    record.score,
                    record.label.map(|l| l.as_str()),
                    record.error,
                    record.used_fallback,
                    record.finished_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Most recent analyses first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<AnalysisRecord>> {
        self.call_named("history.list_recent", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT job_id, subject, chain_id, outcome, report_cid, score, label, error, used_fallback, finished_at
                 FROM analyses
                 ORDER BY finished_at DESC, id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit], row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn find_by_job(&self, job_id: &str) -> Result<Option<AnalysisRecord>> {
        let job_id = job_id.to_string();
        self.call_named("history.find_by_job", move |conn| {
            let rec = conn
                .query_row(
                    "SELECT job_id, subject, chain_id, outcome, report_cid, score, label, error, used_fallback, finished_at
                     FROM analyses WHERE job_id = ?1",
                    [job_id],
                    row_to_record,
                )
                .optional()?;
            Ok(rec)
        })
        .await
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalysisRecord> {
    let chain_id: i64 = row.get(2)?;
    let outcome: String = row.get(3)?;
    let label: Option<String> = row.get(6)?;
    Ok(AnalysisRecord {
        job_id: row.get(0)?,
        subject: row.get(1)?,
        chain_id: u64::try_from(chain_id).unwrap_or_default(),
        outcome: Outcome::parse(&outcome),
        report_cid: row.get(4)?,
        score: row.get(5)?,
        label: label.as_deref().and_then(parse_label),
        error: row.get(7)?,
        used_fallback: row.get(8)?,
        finished_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done(job_id: &str, finished_at: &str) -> AnalysisRecord {
        AnalysisRecord {
            job_id: job_id.to_string(),
            subject: "0x95ad61b0a150d79219dcf64e1e6cc01f0b64c4ce".to_string(),
            chain_id: 1,
            outcome: Outcome::Done,
            report_cid: Some(format!("cid-{job_id}")),
            score: Some(62.0),
            label: Some(RiskLabel::Yellow),
            error: None,
            used_fallback: false,
            finished_at: finished_at.to_string(),
        }
    }

    #[tokio::test]
    async fn test_record_and_list_newest_first() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        db.record_analysis(done("j1", "2026-01-01T00:00:00Z"))
            .await
            .unwrap();
        db.record_analysis(done("j2", "2026-01-02T00:00:00Z"))
            .await
            .unwrap();

        let rows = db.list_recent(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].job_id, "j2");
        assert_eq!(rows[0].label, Some(RiskLabel::Yellow));

        let limited = db.list_recent(1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_same_job_is_replaced_not_duplicated() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let mut failed = done("j1", "2026-01-01T00:00:00Z");
        failed.outcome = Outcome::Error;
        failed.report_cid = None;
        failed.error = Some("report unavailable: bad response: 503".to_string());
        db.record_analysis(failed).await.unwrap();
        db.record_analysis(done("j1", "2026-01-01T00:01:00Z"))
            .await
            .unwrap();

        let rows = db.list_recent(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].outcome, Outcome::Done);
        assert_eq!(rows[0].error, None);
    }

    #[tokio::test]
    async fn test_find_by_job_missing_is_none() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        assert!(db.find_by_job("nope").await.unwrap().is_none());

        let mut rec = done("j9", "2026-01-01T00:00:00Z");
        rec.used_fallback = true;
        db.record_analysis(rec.clone()).await.unwrap();
        assert_eq!(db.find_by_job("j9").await.unwrap(), Some(rec));
    }
}
