use crate::poller::{JobPoller, PollerSettings, PollerStatus, Snapshot};
use crate::render;
use anyhow::{Context, Result};
use common::address::validate_and_normalize;
use common::config::{Config, DEFAULT_CONFIG_PATH};
use common::db::{AnalysisRecord, AsyncDb, Outcome};
use common::fallback::FallbackGateway;
use common::gateway::{Gateway, HttpGateway, ReportQuery};
use common::insights::{InsightsClient, RiskQuery, TechnicalQuery};
use common::types::{JobOutcome, PublishRequest};
use std::sync::Arc;
use tracing::{info, warn};

pub const USAGE: &str = "\
usage: analyzer [--config <path>] <command>

commands:
  analyze <address> [chain]               submit an analysis and follow it to the report
  report <cid>                            fetch a report
  reports [limit] [offset] [query]        list published reports
  publish <cid> <signature> [address]     publish a report
  risk <ticker>                           risk snapshot from the insights service
  technical <ticker>                      technical indicators from the insights service
  history                                 recent analyses run from this machine
";

const DEFAULT_CHAIN_ID: u64 = 1;
const HISTORY_LIMIT: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Analyze { address: String, chain_id: u64 },
    Report { cid: String },
    Reports(ReportQuery),
    Publish(PublishRequest),
    Risk { ticker: String },
    Technical { ticker: String },
    History,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub config_path: String,
    pub command: Command,
}

fn parse_number<T: std::str::FromStr>(what: &str, raw: Option<String>, default: T) -> Result<T, String> {
    match raw {
        None => Ok(default),
        Some(s) => s.parse().ok().ok_or_else(|| format!("invalid {what}: {s}")),
    }
}

fn required(args: &mut impl Iterator<Item = String>, usage: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("usage: analyzer {usage}"))
}

pub fn parse_args<I>(args: I) -> std::result::Result<Invocation, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let mut args = args.skip(1).peekable();

    let mut config_path = DEFAULT_CONFIG_PATH.to_string();
    if args.peek().map(String::as_str) == Some("--config") {
        args.next();
        config_path = args
            .next()
            .ok_or_else(|| "--config needs a path".to_string())?;
    }

    let Some(cmd) = args.next() else {
        return Ok(Invocation {
            config_path,
            command: Command::Help,
        });
    };

    let command = match cmd.as_str() {
        "help" | "-h" | "--help" => Command::Help,
        "analyze" => {
            let address = required(&mut args, "analyze <address> [chain]")?;
            let chain_id = parse_number("chain id", args.next(), DEFAULT_CHAIN_ID)?;
            Command::Analyze { address, chain_id }
        }
        "report" => Command::Report {
            cid: required(&mut args, "report <cid>")?,
        },
        "reports" => {
            let defaults = ReportQuery::default();
            let limit = parse_number("limit", args.next(), defaults.limit)?;
            let offset = parse_number("offset", args.next(), defaults.offset)?;
            let q = args.collect::<Vec<_>>().join(" ");
            Command::Reports(ReportQuery { limit, offset, q })
        }
        "publish" => {
            let usage = "publish <cid> <signature> [address]";
            let cid = required(&mut args, usage)?;
            let signature = required(&mut args, usage)?;
            let address = args.next();
            Command::Publish(PublishRequest {
                cid,
                address,
                signature,
            })
        }
        "risk" => Command::Risk {
            ticker: required(&mut args, "risk <ticker>")?,
        },
        "technical" => Command::Technical {
            ticker: required(&mut args, "technical <ticker>")?,
        },
        "history" => Command::History,
        other => return Err(format!("unknown command: {other}\n\n{USAGE}")),
    };

    Ok(Invocation {
        config_path,
        command,
    })
}

pub async fn run_command(config: &Config, cmd: Command) -> Result<()> {
    match cmd {
        Command::Help => {
            print!("{USAGE}");
            Ok(())
        }
        Command::Analyze { address, chain_id } => {
            let gateway = Arc::new(build_gateway(config)?);
            let ctrl_c = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            analyze(config, gateway, &address, chain_id, ctrl_c).await
        }
        Command::Report { cid } => {
            let fetched = build_gateway(config)?.get_report(&cid).await?;
            if fetched.is_fallback() {
                eprintln!("{}", render::FALLBACK_NOTICE);
            }
            print!("{}", render::render_report(fetched.get()));
            Ok(())
        }
        Command::Reports(query) => {
            let fetched = build_gateway(config)?.list_reports(&query).await?;
            if fetched.is_fallback() {
                eprintln!("{}", render::FALLBACK_NOTICE);
            }
            print!("{}", render::render_report_page(fetched.get(), &query));
            Ok(())
        }
        Command::Publish(mut request) => {
            if let Some(address) = &request.address {
                request.address = Some(validate_and_normalize(address)?);
            }
            let fetched = build_gateway(config)?.publish_report(&request).await?;
            if fetched.is_fallback() {
                eprintln!("{}", render::FALLBACK_NOTICE);
            }
            print!("{}", render::render_receipt(fetched.get()));
            Ok(())
        }
        Command::Risk { ticker } => {
            let query = RiskQuery {
                ticker: Some(ticker),
                ..RiskQuery::default()
            };
            let value = insights_client(config)?.fetch_risk(&query).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Command::Technical { ticker } => {
            let query = TechnicalQuery {
                ticker: Some(ticker),
                ..TechnicalQuery::default()
            };
            let value = insights_client(config)?.fetch_technical(&query).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Command::History => {
            let db = open_history(config).await?;
            let records = db.list_recent(HISTORY_LIMIT).await?;
            print!("{}", render::render_history(&records));
            Ok(())
        }
    }
}

fn build_gateway(config: &Config) -> Result<FallbackGateway<HttpGateway>> {
    let http = HttpGateway::new(&config.gateway.base_url, config.gateway.request_timeout())?;
    if !config.fallback.enabled {
        info!("mock fallback disabled");
    }
    Ok(FallbackGateway::new(http, config.fallback.enabled))
}

fn insights_client(config: &Config) -> Result<InsightsClient> {
    let insights = config
        .insights
        .as_ref()
        .context("insights.base_url is not configured")?;
    InsightsClient::new(&insights.base_url, config.gateway.request_timeout())
}

async fn open_history(config: &Config) -> Result<AsyncDb> {
    if let Some(parent) = std::path::Path::new(&config.history.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    AsyncDb::open(&config.history.path).await
}

/// Submit, follow progress until settled, then render and record the result.
///
/// `shutdown` resolving (Ctrl-C in the binary) stops polling. A completed job
/// whose report could not be fetched gets one explicit refresh before giving up.
async fn analyze<G: Gateway + 'static>(
    config: &Config,
    gateway: Arc<G>,
    raw_address: &str,
    chain_id: u64,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let address = validate_and_normalize(raw_address)?;
    let poller = JobPoller::new(gateway, PollerSettings::from(&config.poller));
    let mut rx = poller.subscribe();

    if let Err(e) = poller.start_analyze(&address, chain_id).await {
        print!("{}", render::render_snapshot(&poller.snapshot()));
        return Err(e).context("analysis submit failed");
    }

    tokio::pin!(shutdown);

    let mut last_line = String::new();
    loop {
        let snapshot = rx.borrow_and_update().clone();
        let line = render::status_line(&snapshot);
        if line != last_line {
            eprintln!("{line}");
            last_line = line;
        }
        if snapshot.is_settled() {
            break;
        }
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            () = &mut shutdown => {
                poller.stop_polling();
                eprintln!("{}", render::status_line(&poller.snapshot()));
                return Ok(());
            }
        }
    }

    let mut snapshot = poller.snapshot();
    if needs_report_refresh(&snapshot) {
        warn!("report fetch failed, retrying once");
        match poller.refresh_report().await {
            Ok(_) => snapshot = poller.snapshot(),
            Err(e) => warn!(error = %e, "report refresh failed"),
        }
    }

    info!(status = snapshot.status.as_str(), used_fallback = snapshot.used_fallback, "analysis settled");
    print!("{}", render::render_snapshot(&snapshot));

    if let Some(record) = history_record(&snapshot, chrono::Utc::now().to_rfc3339()) {
        match open_history(config).await {
            Ok(db) => {
                if let Err(e) = db.record_analysis(record).await {
                    warn!(error = %e, "failed to record analysis history");
                }
            }
            Err(e) => warn!(error = %e, "history database unavailable"),
        }
    }

    match snapshot.status {
        PollerStatus::Error => anyhow::bail!(
            "analysis failed: {}",
            snapshot.error.as_deref().unwrap_or("unknown error")
        ),
        _ => Ok(()),
    }
}

fn needs_report_refresh(snapshot: &Snapshot) -> bool {
    snapshot.status == PollerStatus::Error
        && matches!(
            snapshot.job.as_ref().and_then(|j| j.outcome()),
            Some(JobOutcome::Completed { .. })
        )
}

/// History row for a settled snapshot. `None` when nothing was submitted.
pub fn history_record(snapshot: &Snapshot, finished_at: String) -> Option<AnalysisRecord> {
    let outcome = match snapshot.status {
        PollerStatus::Done => Outcome::Done,
        PollerStatus::Error => Outcome::Error,
        PollerStatus::Idle | PollerStatus::Running => return None,
    };
    let job = snapshot.job.as_ref()?;
    let subject = snapshot.subject.as_ref()?;
    Some(AnalysisRecord {
        job_id: job.id.clone(),
        subject: subject.id.clone(),
        chain_id: subject.chain_id,
        outcome,
        report_cid: job.report_id.clone(),
        score: snapshot.report.as_ref().map(|r| r.score),
        label: snapshot.report.as_ref().map(|r| r.label()),
        error: snapshot.error.clone(),
        used_fallback: snapshot.used_fallback,
        finished_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::RetryStrategy;
    use common::gateway::{Fetched, GatewayError, GatewayResult};
    use common::types::{Job, JobStatus, PublishReceipt, Report, ReportPage, SubmitResponse};
    use std::collections::BTreeMap;

    fn args(list: &[&str]) -> std::vec::IntoIter<String> {
        std::iter::once("analyzer")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_parse_args_defaults_to_help() {
        let inv = parse_args(args(&[])).unwrap();
        assert_eq!(inv.command, Command::Help);
        assert_eq!(inv.config_path, DEFAULT_CONFIG_PATH);
    }

    #[test]
    fn test_parse_analyze_with_and_without_chain() {
        let inv = parse_args(args(&["analyze", "0xabc"])).unwrap();
        assert_eq!(
            inv.command,
            Command::Analyze {
                address: "0xabc".to_string(),
                chain_id: 1
            }
        );

        let inv = parse_args(args(&["--config", "alt.toml", "analyze", "0xabc", "56"])).unwrap();
        assert_eq!(inv.config_path, "alt.toml");
        assert_eq!(
            inv.command,
            Command::Analyze {
                address: "0xabc".to_string(),
                chain_id: 56
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_args(args(&["analyze"])).unwrap_err(),
            "usage: analyzer analyze <address> [chain]"
        );
        assert_eq!(
            parse_args(args(&["analyze", "0xabc", "mainnet"])).unwrap_err(),
            "invalid chain id: mainnet"
        );
        assert!(parse_args(args(&["frobnicate"]))
            .unwrap_err()
            .starts_with("unknown command: frobnicate"));
        assert!(parse_args(args(&["--config"])).is_err());
    }

    #[test]
    fn test_parse_reports_query() {
        let inv = parse_args(args(&["reports"])).unwrap();
        assert_eq!(inv.command, Command::Reports(ReportQuery::default()));

        let inv = parse_args(args(&["reports", "10", "20", "owner", "mint"])).unwrap();
        assert_eq!(
            inv.command,
            Command::Reports(ReportQuery {
                limit: 10,
                offset: 20,
                q: "owner mint".to_string()
            })
        );
    }

    #[test]
    fn test_parse_publish() {
        let inv = parse_args(args(&["publish", "cid1", "0xsig"])).unwrap();
        assert_eq!(
            inv.command,
            Command::Publish(PublishRequest {
                cid: "cid1".to_string(),
                address: None,
                signature: "0xsig".to_string()
            })
        );
        assert!(parse_args(args(&["publish", "cid1"])).is_err());
    }

    fn settled(status: PollerStatus) -> Snapshot {
        let report: Report =
            serde_json::from_value(serde_json::json!({"cid": "r1", "score": 72})).unwrap();
        Snapshot {
            status,
            subject: Some(crate::poller::Subject {
                id: "0xabc".to_string(),
                chain_id: 56,
            }),
            job: Some(Job {
                id: "job-1".to_string(),
                status: JobStatus::Done,
                progress: BTreeMap::new(),
                report_id: Some("r1".to_string()),
                error: None,
            }),
            report: Some(report),
            ..Snapshot::default()
        }
    }

    #[test]
    fn test_history_record_from_done_snapshot() {
        let rec = history_record(&settled(PollerStatus::Done), "t".to_string()).unwrap();
        assert_eq!(rec.job_id, "job-1");
        assert_eq!(rec.chain_id, 56);
        assert_eq!(rec.outcome, Outcome::Done);
        assert_eq!(rec.score, Some(72.0));
        assert_eq!(rec.label, Some(common::types::RiskLabel::Green));
        assert_eq!(rec.report_cid.as_deref(), Some("r1"));
    }

    #[test]
    fn test_history_record_skips_unsettled_and_unsubmitted() {
        assert!(history_record(&settled(PollerStatus::Running), "t".to_string()).is_none());
        assert!(history_record(&Snapshot::default(), "t".to_string()).is_none());

        let mut no_job = settled(PollerStatus::Error);
        no_job.job = None;
        assert!(history_record(&no_job, "t".to_string()).is_none());
    }

    #[test]
    fn test_needs_report_refresh_only_for_completed_jobs() {
        let mut snap = settled(PollerStatus::Error);
        assert!(needs_report_refresh(&snap));
        snap.status = PollerStatus::Done;
        assert!(!needs_report_refresh(&snap));
        snap.status = PollerStatus::Error;
        snap.job = None;
        assert!(!needs_report_refresh(&snap));
    }

    /// Backend that finishes every job on the first check.
    struct InstantGateway {
        report_failures: std::sync::Mutex<u32>,
    }

    impl Gateway for InstantGateway {
        async fn submit_job(&self, _: &str, _: u64) -> GatewayResult<SubmitResponse> {
            Ok(Fetched::Live(SubmitResponse {
                job_id: "job-1".to_string(),
            }))
        }

        async fn get_job_status(&self, job_id: &str) -> GatewayResult<Job> {
            Ok(Fetched::Live(Job {
                id: job_id.to_string(),
                status: JobStatus::Done,
                progress: BTreeMap::new(),
                report_id: Some("r1".to_string()),
                error: None,
            }))
        }

        async fn get_report(&self, cid: &str) -> GatewayResult<Report> {
            let mut failures = self.report_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(GatewayError::Status {
                    status: 503,
                    message: "bad response: 503".to_string(),
                });
            }
            let report = serde_json::from_value(serde_json::json!({"cid": cid, "score": 45}))
                .unwrap();
            Ok(Fetched::Live(report))
        }

        async fn publish_report(&self, _: &PublishRequest) -> GatewayResult<PublishReceipt> {
            unreachable!("not used")
        }

        async fn list_reports(&self, _: &ReportQuery) -> GatewayResult<ReportPage> {
            unreachable!("not used")
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config =
            Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        config.poller.interval_ms = 10;
        config.poller.retry = RetryStrategy::Fixed;
        config.history.path = dir
            .path()
            .join("nested/history.db")
            .to_string_lossy()
            .into_owned();
        config
    }

    #[tokio::test]
    async fn test_analyze_records_history_after_report_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let gateway = Arc::new(InstantGateway {
            report_failures: std::sync::Mutex::new(1),
        });

        analyze(
            &config,
            gateway,
            "see https://etherscan.io/token/0x95aD61b0a150d79219dCF64E1E6Cc01f0B64C4cE",
            1,
            std::future::pending(),
        )
        .await
        .unwrap();

        let db = AsyncDb::open(&config.history.path).await.unwrap();
        let rec = db.find_by_job("job-1").await.unwrap().unwrap();
        assert_eq!(rec.subject, "0x95ad61b0a150d79219dcf64e1e6cc01f0b64c4ce");
        assert_eq!(rec.outcome, Outcome::Done);
        assert_eq!(rec.score, Some(45.0));
    }

    #[tokio::test]
    async fn test_analyze_rejects_bad_address_before_submitting() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let gateway = Arc::new(InstantGateway {
            report_failures: std::sync::Mutex::new(0),
        });

        let err = analyze(&config, gateway, "0x1234", 1, std::future::pending())
            .await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid format: must be 0x followed by 40 hex characters."
        );
        assert!(!std::path::Path::new(&config.history.path).exists());
    }

    #[tokio::test]
    async fn test_analyze_reports_failure_when_report_stays_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let gateway = Arc::new(InstantGateway {
            report_failures: std::sync::Mutex::new(2),
        });

        let err = analyze(
            &config,
            gateway,
            "0x95ad61b0a150d79219dcf64e1e6cc01f0b64c4ce",
            1,
            std::future::pending(),
        )
        .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "analysis failed: report unavailable: bad response: 503"
        );

        let db = AsyncDb::open(&config.history.path).await.unwrap();
        let rec = db.find_by_job("job-1").await.unwrap().unwrap();
        assert_eq!(rec.outcome, Outcome::Error);
        assert_eq!(rec.report_cid.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_analyze_shutdown_signal_stops_without_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.poller.interval_ms = 60_000;
        let gateway = Arc::new(InstantGateway {
            report_failures: std::sync::Mutex::new(0),
        });

        // Fired before the follow loop starts; it must still be observed.
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tx.send(()).unwrap();
        let shutdown = async {
            let _ = rx.await;
        };

        analyze(
            &config,
            gateway,
            "0x95ad61b0a150d79219dcf64e1e6cc01f0b64c4ce",
            1,
            shutdown,
        )
        .await
        .unwrap();
        assert!(!std::path::Path::new(&config.history.path).exists());
    }
}
