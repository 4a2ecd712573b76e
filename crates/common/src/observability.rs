use std::borrow::Cow;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogFormat;

/// Flushes the global tracer provider on drop.
pub struct OtelGuard {
    _private: (),
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

struct ErrorCounterLayer;

impl<S> Layer<S> for ErrorCounterLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            metrics::counter!("analysis_error_events").increment(1);
        }
    }
}

/// Build a `tracing` dispatcher configured for:
/// - logs on stderr, JSON or human-readable per `format` (stdout is left to command output)
/// - EnvFilter that respects `RUST_LOG` (takes precedence) and falls back to `default_level`
/// - `analysis_error_events` counter for ERROR events
/// - OpenTelemetry OTLP trace export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
pub fn build_dispatch(
    service_name: impl Into<Cow<'static, str>>,
    default_level: &str,
    format: LogFormat,
) -> (tracing::Dispatch, Option<OtelGuard>) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let service_name = service_name.into();
    let tracer = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|endpoint| otlp_tracer(&endpoint, &service_name));
    let guard = tracer.as_ref().map(|_| OtelGuard { _private: () });
    let otel_layer = tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t));

    let subscriber = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .with(ErrorCounterLayer)
        .with(otel_layer);

    (tracing::Dispatch::new(subscriber), guard)
}

/// Requires a Tokio runtime for the batch exporter.
fn otlp_tracer(endpoint: &str, service_name: &str) -> Option<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_otlp::WithExportConfig;

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("OTLP exporter disabled: {e}");
            return None;
        }
    };

    let resource = Resource::new(vec![KeyValue::new(
        "service.name",
        service_name.to_string(),
    )]);

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(resource)
        .build();

    let tracer = provider.tracer("token_analyzer");
    let _ = opentelemetry::global::set_tracer_provider(provider);
    Some(tracer)
}
