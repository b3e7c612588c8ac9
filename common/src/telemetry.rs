// Telemetry: structured logging, tracing export, and alert engine metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "deadline-alerts";

/// Initialize JSON logging, with an OpenTelemetry layer when an OTLP
/// endpoint is configured.
///
/// `RUST_LOG` takes precedence over `log_level`.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");

    Ok(tracer)
}

/// Flush remaining spans on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus exporter and describe the engine's metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("alerts_sent_total", "Alerts accepted by the messaging gateway");
    describe_counter!("alerts_failed_total", "Alerts the messaging gateway did not accept");
    describe_counter!(
        "alerts_skipped_total",
        "Due alerts skipped because they were already sent or in flight"
    );
    describe_counter!("alert_sweeps_total", "Reconciliation sweeps by outcome");
    describe_histogram!(
        "alert_sweep_duration_seconds",
        "Duration of reconciliation sweeps in seconds"
    );
    describe_gauge!("alert_timers_armed", "One-shot alert timers currently armed");

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_alert_sent(milestone: &str, trigger: &str) {
    counter!(
        "alerts_sent_total",
        "milestone" => milestone.to_string(),
        "trigger" => trigger.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_alert_failed(milestone: &str, reason: &str) {
    counter!(
        "alerts_failed_total",
        "milestone" => milestone.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// `reason` is "already_sent" or "in_flight"
#[inline]
pub fn record_alert_skipped(reason: &str) {
    counter!("alerts_skipped_total", "reason" => reason.to_string()).increment(1);
}

#[inline]
pub fn record_sweep(outcome: &str, duration_seconds: f64) {
    counter!("alert_sweeps_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("alert_sweep_duration_seconds").record(duration_seconds);
}

#[inline]
pub fn update_timers_armed(count: usize) {
    gauge!("alert_timers_armed").set(count as f64);
}
