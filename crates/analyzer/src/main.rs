use anyhow::Result;

mod cli;
mod metrics;
mod poller;
mod render;
mod retry;

#[tokio::main]
async fn main() -> Result<()> {
    let invocation = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;
    if invocation.command == cli::Command::Help {
        print!("{}", cli::USAGE);
        return Ok(());
    }

    let config = common::config::Config::load(&invocation.config_path)?;

    let (dispatch, _otel_guard) = common::observability::build_dispatch(
        "analyzer",
        &config.general.log_level,
        config.general.log_format,
    );
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    if let Some(port) = config.observability.prometheus_port {
        metrics::install_prometheus(port)?;
        tracing::info!(port, "prometheus exporter listening");
    }
    metrics::describe();

    cli::run_command(&config, invocation.command).await
}
