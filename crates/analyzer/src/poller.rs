//! Job lifecycle: submit an analysis, follow its status until it settles,
//! then fetch the report.
//!
//! State lives in a `watch` channel so consumers read snapshots without
//! touching the poller. Every write made on behalf of a job is tagged with the
//! epoch it was started in; `start_analyze`, `stop_polling` and `Drop` bump the
//! epoch, so a stale task can never overwrite newer state.

use crate::metrics::{
    JOBS_FINISHED, JOBS_SUBMITTED, REPORT_FETCH_FAILURES, STATUS_CHECKS, STATUS_CHECK_FAILURES,
};
use crate::retry::RetryPolicy;
use common::fallback::is_mock_job;
use common::gateway::{Fetched, Gateway, GatewayError};
use common::types::{Job, JobOutcome, Report};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollerStatus {
    #[default]
    Idle,
    Running,
    Done,
    Error,
}

impl PollerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
    pub chain_id: u64,
}

/// Read-only view of the poller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub status: PollerStatus,
    pub subject: Option<Subject>,
    pub job: Option<Job>,
    pub report: Option<Report>,
    pub error: Option<String>,
    /// Set while status checks keep failing. Polling continues.
    pub warning: Option<String>,
    /// Any part of this snapshot came from mock fallback data.
    pub used_fallback: bool,
    /// Bumped on every start and stop. Writes from older tasks are dropped.
    pub(crate) epoch: u64,
}

impl Snapshot {
    pub fn is_settled(&self) -> bool {
        self.status != PollerStatus::Running
    }
}

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error(transparent)]
    Submit(GatewayError),
    #[error("analysis was cancelled")]
    Cancelled,
    #[error("no completed job to fetch a report for")]
    NoReport,
    #[error("report unavailable: {0}")]
    Report(GatewayError),
    #[error("report unavailable: backend unreachable")]
    ReportUnreachable,
}

/// A mock report never stands in for the report of a job the live backend ran.
fn accept_report(job_id: &str, fetched: Fetched<Report>) -> Result<Fetched<Report>, AnalyzeError> {
    if fetched.is_fallback() && !is_mock_job(job_id) {
        return Err(AnalyzeError::ReportUnreachable);
    }
    Ok(fetched)
}

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub policy: RetryPolicy,
    /// Consecutive failed checks before a warning is attached. 0 disables it.
    pub surface_after_failures: u32,
}

impl From<&common::config::Poller> for PollerSettings {
    fn from(cfg: &common::config::Poller) -> Self {
        Self {
            policy: RetryPolicy::new(Duration::from_millis(cfg.interval_ms), cfg.retry),
            surface_after_failures: cfg.surface_after_failures,
        }
    }
}

/// Owned polling task. Dropping it cancels the task.
struct PollHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

type State = Arc<watch::Sender<Snapshot>>;

/// Apply `f` only if the state still belongs to `epoch`.
fn apply_if(state: &watch::Sender<Snapshot>, epoch: u64, f: impl FnOnce(&mut Snapshot)) -> bool {
    state.send_if_modified(|s| {
        if s.epoch != epoch {
            return false;
        }
        f(s);
        true
    })
}

pub struct JobPoller<G> {
    gateway: Arc<G>,
    settings: PollerSettings,
    state: State,
    handle: Mutex<Option<PollHandle>>,
}

impl<G: Gateway + 'static> JobPoller<G> {
    pub fn new(gateway: Arc<G>, settings: PollerSettings) -> Self {
        let (tx, _rx) = watch::channel(Snapshot::default());
        Self {
            gateway,
            settings,
            state: Arc::new(tx),
            handle: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state.subscribe()
    }

    /// Submit a new analysis and start following it.
    ///
    /// Any previous job is cancelled and its job, report and error cleared.
    /// `subject_id` is expected to be validated by the caller.
    pub async fn start_analyze(&self, subject_id: &str, chain_id: u64) -> Result<String, AnalyzeError> {
        let subject = Subject {
            id: subject_id.to_string(),
            chain_id,
        };
        let epoch = {
            let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
            slot.take();
            let mut epoch = 0;
            self.state.send_modify(|s| {
                epoch = s.epoch + 1;
                *s = Snapshot {
                    status: PollerStatus::Running,
                    subject: Some(subject),
                    epoch,
                    ..Snapshot::default()
                };
            });
            epoch
        };

        info!(subject = subject_id, chain_id, "submitting analysis");
        let submitted = match self.gateway.submit_job(subject_id, chain_id).await {
            Ok(submitted) => submitted,
            Err(e) => {
                error!(subject = subject_id, error = %e, "analysis submit failed");
                let message = e.to_string();
                if !apply_if(&self.state, epoch, |s| {
                    s.status = PollerStatus::Error;
                    s.error = Some(message);
                }) {
                    return Err(AnalyzeError::Cancelled);
                }
                metrics::counter!(JOBS_FINISHED, "outcome" => "submit_error").increment(1);
                return Err(AnalyzeError::Submit(e));
            }
        };

        let used_fallback = submitted.is_fallback();
        let job_id = submitted.into_inner().job_id;
        metrics::counter!(JOBS_SUBMITTED).increment(1);

        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let accepted = apply_if(&self.state, epoch, |s| {
            s.job = Some(Job::submitted(job_id.clone()));
            s.used_fallback |= used_fallback;
        });
        if !accepted {
            debug!(job_id = %job_id, "analysis cancelled before polling started");
            return Err(AnalyzeError::Cancelled);
        }

        info!(job_id = %job_id, fallback = used_fallback, "job submitted, polling status");
        let cancel = CancellationToken::new();
        let task = PollTask {
            gateway: Arc::clone(&self.gateway),
            state: Arc::clone(&self.state),
            settings: self.settings,
            epoch,
            job_id: job_id.clone(),
            cancel: cancel.clone(),
        };
        *slot = Some(PollHandle {
            cancel,
            task: tokio::spawn(task.run()),
        });
        Ok(job_id)
    }

    /// Explicitly re-fetch the report of the current completed job.
    ///
    /// A failure leaves the current state untouched.
    pub async fn refresh_report(&self) -> Result<Report, AnalyzeError> {
        let (epoch, job_id, report_id) = {
            let s = self.state.borrow();
            let report_id = match s.job.as_ref().and_then(Job::outcome) {
                Some(JobOutcome::Completed { report_id }) if s.is_settled() => {
                    report_id.to_string()
                }
                _ => return Err(AnalyzeError::NoReport),
            };
            let job_id = s.job.as_ref().map(|j| j.id.clone()).unwrap_or_default();
            (s.epoch, job_id, report_id)
        };

        let fetched = self
            .gateway
            .get_report(&report_id)
            .await
            .map_err(AnalyzeError::Report)?;
        let fetched = accept_report(&job_id, fetched)?;
        let used_fallback = fetched.is_fallback();
        let report = fetched.into_inner();

        let applied = apply_if(&self.state, epoch, |s| {
            s.status = PollerStatus::Done;
            s.report = Some(report.clone());
            s.error = None;
            s.used_fallback |= used_fallback;
        });
        if !applied {
            return Err(AnalyzeError::Cancelled);
        }
        info!(report_id = %report_id, "report refreshed");
        Ok(report)
    }

    /// Wait until the current job settles and return the final snapshot.
    pub async fn wait_until_settled(&self) -> Snapshot {
        let mut rx = self.subscribe();
        let settled = rx.wait_for(Snapshot::is_settled).await.map(|s| s.clone());
        settled.unwrap_or_else(|_| self.snapshot())
    }
}

impl<G> JobPoller<G> {
    /// Cancel the outstanding poll, if any, and go back to `idle`.
    ///
    /// Idempotent. A settled job (done or error) is left on display.
    /// Returns whether anything was running.
    pub fn stop_polling(&self) -> bool {
        let was_running = self.cancel_current();
        if was_running {
            self.state.send_modify(|s| {
                s.status = PollerStatus::Idle;
                s.warning = None;
            });
            info!("polling stopped");
        }
        was_running
    }

    /// Drop the task and invalidate its epoch. Returns whether a job was in flight.
    fn cancel_current(&self) -> bool {
        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        slot.take();
        let mut was_running = false;
        self.state.send_modify(|s| {
            was_running = s.status == PollerStatus::Running;
            s.epoch += 1;
        });
        was_running
    }
}

impl<G> Drop for JobPoller<G> {
    fn drop(&mut self) {
        self.cancel_current();
    }
}

/// Everything the spawned status loop needs, owned.
struct PollTask<G> {
    gateway: Arc<G>,
    state: State,
    settings: PollerSettings,
    epoch: u64,
    job_id: String,
    cancel: CancellationToken,
}

enum Settled {
    Completed(String),
    Failed(String),
}

impl<G: Gateway> PollTask<G> {
    fn apply(&self, f: impl FnOnce(&mut Snapshot)) -> bool {
        apply_if(&self.state, self.epoch, f)
    }

    async fn run(self) {
        let job_id = self.job_id.as_str();
        let mut failures: u32 = 0;

        loop {
            let Some(delay) = self.settings.policy.next_delay(failures) else {
                error!(job_id, failures, "giving up on job status");
                self.apply(|s| {
                    s.status = PollerStatus::Error;
                    s.error = Some(format!(
                        "status polling gave up after {failures} consecutive failures"
                    ));
                    s.warning = None;
                });
                metrics::counter!(JOBS_FINISHED, "outcome" => "gave_up").increment(1);
                break;
            };

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            metrics::counter!(STATUS_CHECKS).increment(1);
            let result = tokio::select! {
                () = self.cancel.cancelled() => break,
                r = self.gateway.get_job_status(job_id) => r,
            };

            // Mock status for a live job would end the loop on made-up data.
            let result = match result {
                Ok(fetched) if fetched.is_fallback() && !is_mock_job(job_id) => {
                    Err("backend unreachable".to_string())
                }
                other => other.map_err(|e| e.to_string()),
            };
            let fetched = match result {
                Ok(fetched) => fetched,
                Err(e) => {
                    failures += 1;
                    metrics::counter!(STATUS_CHECK_FAILURES).increment(1);
                    warn!(job_id, attempt = failures, error = %e, "status check failed, will retry");
                    let surface_after = self.settings.surface_after_failures;
                    if surface_after > 0 && failures >= surface_after {
                        let warning = format!("{failures} consecutive status checks failed: {e}");
                        self.apply(|s| s.warning = Some(warning));
                    }
                    continue;
                }
            };
            failures = 0;

            let used_fallback = fetched.is_fallback();
            let mut job = fetched.into_inner();
            if job.id.is_empty() {
                job.id = job_id.to_string();
            }
            let settled = job.outcome().map(|o| match o {
                JobOutcome::Completed { report_id } => Settled::Completed(report_id.to_string()),
                JobOutcome::Failed { error } => Settled::Failed(error.to_string()),
            });
            debug!(job_id, status = job.status.as_str(), "job status");

            match settled {
                None => {
                    if !self.apply(|s| {
                        s.job = Some(job);
                        s.warning = None;
                        s.used_fallback |= used_fallback;
                    }) {
                        break;
                    }
                }
                Some(Settled::Failed(message)) => {
                    warn!(job_id, error = %message, "job failed");
                    self.apply(|s| {
                        s.status = PollerStatus::Error;
                        s.job = Some(job);
                        s.error = Some(message);
                        s.warning = None;
                        s.used_fallback |= used_fallback;
                    });
                    metrics::counter!(JOBS_FINISHED, "outcome" => "failed").increment(1);
                    break;
                }
                Some(Settled::Completed(report_id)) => {
                    let accepted = self.apply(|s| {
                        s.job = Some(job);
                        s.warning = None;
                        s.used_fallback |= used_fallback;
                    });
                    if accepted {
                        self.fetch_report(&report_id).await;
                    }
                    break;
                }
            }
        }
    }

    /// The one automatic report fetch for a completed job.
    async fn fetch_report(&self, report_id: &str) {
        let result = tokio::select! {
            () = self.cancel.cancelled() => return,
            r = self.gateway.get_report(report_id) => r,
        };

        let result = result
            .map_err(AnalyzeError::Report)
            .and_then(|fetched| accept_report(&self.job_id, fetched));
        match result {
            Ok(fetched) => {
                let used_fallback = fetched.is_fallback();
                let report = fetched.into_inner();
                info!(job_id = %self.job_id, report_id, score = report.score, "report ready");
                self.apply(|s| {
                    s.status = PollerStatus::Done;
                    s.report = Some(report);
                    s.used_fallback |= used_fallback;
                });
                metrics::counter!(JOBS_FINISHED, "outcome" => "done").increment(1);
            }
            Err(e) => {
                error!(job_id = %self.job_id, report_id, error = %e, "report fetch failed");
                let message = e.to_string();
                self.apply(|s| {
                    s.status = PollerStatus::Error;
                    s.error = Some(message);
                });
                metrics::counter!(REPORT_FETCH_FAILURES).increment(1);
                metrics::counter!(JOBS_FINISHED, "outcome" => "report_error").increment(1);
            }
        }
    }
}
