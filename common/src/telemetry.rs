// Telemetry module for structured logging and metrics

use crate::config::{LogFormat, ObservabilityConfig};
use crate::models::{MeasurementKind, ServiceKind, TaskState};
use anyhow::{Context, Result};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging
///
/// This function sets up the tracing subscriber with:
/// - JSON or human-readable formatting
/// - Log level from `RUST_LOG`, falling back to the configured level
/// - Output on stderr, so command output on stdout stays machine-readable
pub fn init_logging(log_level: &str, format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::debug!(log_level = log_level, format = ?format, "Structured logging initialized");
    Ok(())
}

/// Initialize metrics
///
/// Registers metric descriptions and, when `pushgateway_endpoint` is set, installs
/// a Prometheus exporter that pushes to it every `push_interval_seconds`:
/// - aif_service_start_total: Counter of `start` outcomes
/// - aif_resolution_seconds: Histogram of node resolution time
/// - aif_probe_total: Counter of readiness verdicts
/// - aif_measurement_total: Counter of finished benchmarks and monitors
/// - aif_samples_collected_total: Counter of monitor samples
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if let Some(endpoint) = &config.pushgateway_endpoint {
        PrometheusBuilder::new()
            .with_push_gateway(
                endpoint.as_str(),
                Duration::from_secs(config.push_interval_seconds),
                None,
                None,
            )
            .context("Invalid push gateway configuration")?
            .install()
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

        tracing::info!(
            endpoint = %endpoint,
            push_interval_seconds = config.push_interval_seconds,
            "Prometheus push gateway exporter initialized"
        );
    }

    describe_counter!("aif_service_start_total", "Service start attempts by outcome");
    describe_histogram!(
        "aif_resolution_seconds",
        "Time spent waiting for a job to get a node, in seconds"
    );
    describe_counter!("aif_probe_total", "Readiness probe verdicts");
    describe_counter!("aif_measurement_total", "Finished measurements by kind and state");
    describe_counter!("aif_samples_collected_total", "Monitor samples collected");

    Ok(())
}

/// Record the outcome of one `start` call
#[inline]
pub fn record_service_start(outcome: &str) {
    counter!("aif_service_start_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record how a node resolution ended and how long it took
#[inline]
pub fn record_resolution(outcome: &str, elapsed: Duration) {
    histogram!("aif_resolution_seconds", "outcome" => outcome.to_string())
        .record(elapsed.as_secs_f64());
}

#[inline]
pub fn record_probe(kind: ServiceKind, healthy: bool) {
    counter!(
        "aif_probe_total",
        "kind" => kind.to_string(),
        "healthy" => healthy.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_measurement(kind: MeasurementKind, state: TaskState) {
    counter!(
        "aif_measurement_total",
        "kind" => kind.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_sample(kind: ServiceKind) {
    counter!("aif_samples_collected_total", "kind" => kind.to_string()).increment(1);
}
