use anyhow::Result;
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub const JOBS_SUBMITTED: &str = "analyzer_jobs_submitted_total";
pub const STATUS_CHECKS: &str = "analyzer_status_checks_total";
pub const STATUS_CHECK_FAILURES: &str = "analyzer_status_check_failures_total";
pub const JOBS_FINISHED: &str = "analyzer_jobs_finished_total";
pub const REPORT_FETCH_FAILURES: &str = "analyzer_report_fetch_failures_total";

pub fn describe() {
    describe_counter!(JOBS_SUBMITTED, "Analysis jobs accepted by the backend.");
    describe_counter!(STATUS_CHECKS, "Job status requests issued.");
    describe_counter!(
        STATUS_CHECK_FAILURES,
        "Job status requests that failed and were retried."
    );
    describe_counter!(
        JOBS_FINISHED,
        "Jobs that reached a terminal state, labelled by outcome."
    );
    describe_counter!(
        REPORT_FETCH_FAILURES,
        "Report fetches that failed after the job completed."
    );
    describe_counter!(
        "gateway_fallbacks_total",
        "Gateway calls answered with mock data."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_handle_renders_metric_names() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe();
            metrics::counter!(JOBS_FINISHED, "outcome" => "done").increment(1);
        });

        let rendered = handle.render();
        assert!(rendered.contains("analyzer_jobs_finished_total"));
        assert!(rendered.contains("outcome=\"done\""));
    }
}
