//! Logging, tracing and metrics setup.
//!
//! A fmt layer is always installed. With an OTLP endpoint, spans, metrics
//! and log events are exported there too.

pub mod metrics;
pub mod task;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::Config;
use crate::error::{Error, Result};

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            service_name: service_name.into(),
            log_level: "info".to_string(),
        }
    }

    /// Endpoint and log level taken from the process configuration.
    pub fn from_config(service_name: impl Into<String>, config: &Config) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            log_level: config.log_level.clone(),
            ..Self::new(service_name)
        }
    }
}

/// The three OTLP pipelines, live only when an endpoint is configured.
struct Exporters {
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
    logs: SdkLoggerProvider,
}

impl Exporters {
    fn connect(endpoint: &str, service_name: String) -> Result<Self> {
        let resource = Resource::builder()
            .with_service_name(service_name)
            .with_attribute(KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            ))
            .build();

        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("span"))?;
        let traces = SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build();

        let readings = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("metric"))?;
        let metrics = SdkMeterProvider::builder()
            .with_periodic_exporter(readings)
            .with_resource(resource.clone())
            .build();
        opentelemetry::global::set_meter_provider(metrics.clone());

        let records = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("log"))?;
        let logs = SdkLoggerProvider::builder()
            .with_batch_exporter(records)
            .with_resource(resource)
            .build();

        Ok(Self {
            traces,
            metrics,
            logs,
        })
    }
}

fn exporter_error<E: std::fmt::Display>(signal: &'static str) -> impl Fn(E) -> Error {
    move |e| Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

/// Flushes and shuts down the exporters on drop. Hold it for the lifetime
/// of the process.
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

impl TelemetryGuard {
    pub fn is_exporting(&self) -> bool {
        self.exporters.is_some()
    }

    pub fn force_flush(&self) {
        if let Some(ex) = &self.exporters {
            let _ = ex.traces.force_flush();
            let _ = ex.metrics.force_flush();
            let _ = ex.logs.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Logs first, span shutdown may still emit events.
        if let Some(ex) = self.exporters.take() {
            let _ = ex.logs.shutdown();
            let _ = ex.metrics.shutdown();
            let _ = ex.traces.shutdown();
        }
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if an OTLP exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let fmt = tracing_subscriber::fmt::layer().with_thread_names(true);

    let exporters = config
        .endpoint
        .as_deref()
        .map(|endpoint| Exporters::connect(endpoint, config.service_name.clone()))
        .transpose()?;

    let (trace_layer, log_layer) = match &exporters {
        Some(ex) => (
            Some(tracing_opentelemetry::layer().with_tracer(ex.traces.tracer("taskq"))),
            Some(opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&ex.logs)),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard { exporters })
}
