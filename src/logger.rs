use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, MeterProvider};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

const SERVICE_NAME: &str = "converse";

/// What `init_tracing` installed. OTLP providers are flushed on `shutdown`.
pub enum TelemetryGuard {
    Files,
    Otlp(Telemetry),
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let TelemetryGuard::Otlp(telemetry) = self {
            telemetry.shutdown();
        }
    }
}

/// Installs the global subscriber.
///
/// Without an OTLP endpoint everything goes to daily rolling files under
/// `root`: a text log plus a JSON log holding the `target = "request"` records
/// the pipeline writes once per processed event.
pub fn init_tracing(
    root: PathBuf,
    log_file: String,
    event_file: String,
    log_level: String,
    otel_endpoint: Option<String>,
) -> Result<TelemetryGuard> {
    match otel_endpoint {
        Some(endpoint) => Ok(TelemetryGuard::Otlp(Telemetry::init(&log_level, &endpoint)?)),
        None => {
            FileTelemetry::init_files(&log_level, &root.join(log_file), &root.join(event_file))?;
            Ok(TelemetryGuard::Files)
        }
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_traces(endpoint: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("span exporter")?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(endpoint: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// OTLP logs, traces and metrics.
pub struct Telemetry {
    pub logger_provider: SdkLoggerProvider,
    pub tracer_provider: SdkTracerProvider,
    pub meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn init(log_level: &str, endpoint: &str) -> Result<Self> {
        let logger_provider = init_logs(endpoint)?;
        let tracer_provider = init_traces(endpoint)?;
        let meter_provider = init_metrics(endpoint)?;

        // exporter internals would otherwise log into themselves
        let otel_filter = EnvFilter::new(log_level)
            .add_directive("hyper=off".parse()?)
            .add_directive("tonic=off".parse()?)
            .add_directive("h2=off".parse()?)
            .add_directive("sqlx=warn".parse()?);
        let otel_logs_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(otel_filter);

        let fmt_layer = fmt::layer()
            .with_thread_names(true)
            .with_filter(EnvFilter::new(log_level));

        Registry::default()
            .with(otel_logs_layer)
            .with(fmt_layer)
            .try_init()
            .context("tracing subscriber already installed")?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        Ok(Telemetry {
            logger_provider,
            tracer_provider,
            meter_provider,
        })
    }

    pub fn shutdown(self) {
        let _ = self.tracer_provider.shutdown();
        let _ = self.meter_provider.shutdown();
        let _ = self.logger_provider.shutdown();
    }
}

/// Plain files only.
pub struct FileTelemetry;

impl FileTelemetry {
    /// - `log_level` is an `EnvFilter` directive (e.g. `"info"`).
    /// - `log_file` is the rolling text log.
    /// - `event_file` is the rolling JSON log of processed events.
    pub fn init_files(log_level: &str, log_file: &Path, event_file: &Path) -> Result<Self> {
        let (txt_dir, txt_name) = split_path(log_file)?;
        let (json_dir, json_name) = split_path(event_file)?;

        let txt_appender = RollingFileAppender::new(Rotation::DAILY, txt_dir, txt_name);
        let txt_layer = fmt::Layer::default()
            .with_writer(txt_appender)
            .with_ansi(false)
            .with_filter(EnvFilter::new(log_level));

        let json_appender = RollingFileAppender::new(Rotation::DAILY, json_dir, json_name);
        let json_layer = fmt::layer()
            .json()
            .with_writer(json_appender)
            .with_target(true)
            .with_filter(EnvFilter::new("request=info"));

        Registry::default()
            .with(txt_layer)
            .with(json_layer)
            .try_init()
            .context("tracing subscriber already installed")?;

        Ok(FileTelemetry)
    }
}

fn split_path(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = path
        .file_name()
        .with_context(|| format!("log path {} has no file name", path.display()))?;
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok((dir, PathBuf::from(name)))
}

/// Counters the event pipeline records into. Built from the global meter, so
/// they are no-ops until an OTLP meter provider is installed.
#[derive(Clone)]
pub struct PipelineMetrics {
    events_processed: Counter<u64>,
    events_failed: Counter<u64>,
    middleware_latency_ms: Histogram<f64>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        let meter = global::meter_provider().meter(SERVICE_NAME);
        let events_processed = meter
            .u64_counter("events_processed")
            .with_description("Events that went through a middleware chain")
            .build();
        let events_failed = meter
            .u64_counter("events_failed")
            .with_description("Events whose chain failed or timed out")
            .build();
        let middleware_latency_ms = meter
            .f64_histogram("middleware_latency_ms")
            .with_description("Time spent inside one middleware")
            .with_unit("ms")
            .build();
        Self {
            events_processed,
            events_failed,
            middleware_latency_ms,
        }
    }

    pub fn middleware_finished(&self, middleware: &str, elapsed: Duration) {
        self.middleware_latency_ms.record(
            elapsed.as_secs_f64() * 1_000.0,
            &[KeyValue::new("middleware", middleware.to_string())],
        );
    }

    /// Records the end of one chain run and writes the JSON request line.
    pub fn event_finished(&self, event_id: &str, direction: &str, status: &str, elapsed: Duration) {
        let attrs = [KeyValue::new("direction", direction.to_string())];
        if status == "failed" {
            self.events_failed.add(1, &attrs);
        } else {
            self.events_processed.add(1, &attrs);
        }
        tracing::event!(
            target: "request",
            tracing::Level::INFO,
            event_id,
            direction,
            status,
            latency_ms = elapsed.as_secs_f64() * 1_000.0,
        );
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
