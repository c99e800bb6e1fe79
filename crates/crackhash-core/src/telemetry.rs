//! Logging, tracing and metrics for the crackhash binaries.
//!
//! Every binary logs through a `tracing_subscriber` registry filtered by
//! `RUST_LOG` (default `info`). OpenTelemetry export is opt-in through cargo
//! features:
//!
//! - `otel`: export `#[tracing::instrument]` spans.
//! - `metrics`: export the request, task and broker counters and the task
//!   duration histogram. Without it the `increment_*` and `record_*` helpers
//!   are no-ops, so call sites never need `cfg` guards.
//! - `stdout`: print exported data to stdout.
//! - `otlp`: ship exported data to an OTLP/gRPC collector. The endpoint and
//!   headers come from the standard `OTEL_EXPORTER_OTLP_*` variables.
//!
//! An exporter without `otel` or `metrics` has nothing to export and is
//! refused at compile time.
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://collector:4317 \
//!     cargo run -p crackhash-manager --features otel,metrics,otlp
//! ```

#[cfg(all(
    any(feature = "stdout", feature = "otlp"),
    not(any(feature = "otel", feature = "metrics"))
))]
compile_error!("The 'stdout' and 'otlp' exporters require 'otel' or 'metrics'.");

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace as sdktrace;

/// How often metrics are pushed to the exporters.
#[cfg(feature = "metrics")]
const METRICS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Handles that must outlive the subscriber so buffered data is flushed on
/// exit.
pub struct TelemetryProviders {
    #[cfg(feature = "otel")]
    tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes pending exports and shuts the providers down.
    pub fn shutdown(self) {
        #[cfg(feature = "otel")]
        if let Err(err) = self.tracer_provider.shutdown() {
            eprintln!("Error shutting down tracer: {err:#?}");
        }

        #[cfg(feature = "metrics")]
        if let Err(err) = self.meter_provider.shutdown() {
            eprintln!("Error shutting down meter: {err:#?}");
        }
    }
}

/// Installs the global subscriber for `service_name`.
pub fn init_telemetry(service_name: &'static str) -> anyhow::Result<TelemetryProviders> {
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .compact(),
        );

    #[cfg(any(feature = "metrics", feature = "otel"))]
    let scope = InstrumentationScope::builder(service_name)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    #[cfg(feature = "otel")]
    let (registry, tracer_provider) = {
        let tracer_provider = init_tracer(service_name)?;
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        let layer = tracing_opentelemetry::layer()
            .with_tracer(tracer_provider.tracer_with_scope(scope.clone()));
        (registry.with(layer), tracer_provider)
    };

    #[cfg(feature = "metrics")]
    let (registry, meter_provider) = {
        let meter_provider = init_metrics(service_name)?;
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        init_metric_handles(opentelemetry::global::meter_with_scope(scope));
        let layer = tracing_opentelemetry::MetricsLayer::new(meter_provider.clone());
        (registry.with(layer), meter_provider)
    };

    #[cfg(not(any(feature = "metrics", feature = "otel")))]
    let _ = service_name;

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "otel")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "otel"))]
fn resource(service_name: &'static str) -> Resource {
    Resource::builder()
        .with_service_name(service_name)
        .with_attribute(KeyValue::new(
            semvcns::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics(service_name: &'static str) -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource(service_name));

    #[cfg(feature = "stdout")]
    let builder = builder.with_reader(
        sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(METRICS_INTERVAL)
            .build(),
    );

    #[cfg(feature = "otlp")]
    let builder = {
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .build()?;
        builder.with_reader(
            sdkmetrics::PeriodicReader::builder(exporter)
                .with_interval(METRICS_INTERVAL)
                .build(),
        )
    };

    Ok(builder.build())
}

#[cfg(feature = "otel")]
fn init_tracer(service_name: &'static str) -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource(service_name));

    #[cfg(feature = "stdout")]
    let builder = builder.with_batch_exporter(opentelemetry_stdout::SpanExporter::default());

    #[cfg(feature = "otlp")]
    let builder = builder.with_batch_exporter(
        opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .build()?,
    );

    Ok(builder.build())
}

// Metric handles - only compiled when metrics feature is enabled
#[cfg(feature = "metrics")]
static REQUESTS_CREATED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUESTS_REJECTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUESTS_EXPIRED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASKS_PUBLISHED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static PUBLISH_FAILURES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RESPONSES_INGESTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static MALFORMED_PAYLOADS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RECONNECTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASKS_PROCESSED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASK_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let counters = [
        (&REQUESTS_CREATED, "requests_created", "Accepted crack requests"),
        (&REQUESTS_REJECTED, "requests_rejected", "Requests refused by admission control or validation"),
        (&REQUESTS_EXPIRED, "requests_expired", "Requests that hit their response timeout"),
        (&TASKS_PUBLISHED, "tasks_published", "Tasks accepted by the broker"),
        (&PUBLISH_FAILURES, "publish_failures", "Task publishes that failed or were deferred"),
        (&RESPONSES_INGESTED, "responses_ingested", "Worker responses merged into request state"),
        (&MALFORMED_PAYLOADS, "malformed_payloads", "Deliveries rejected because they failed to decode"),
        (&RECONNECTS, "reconnects", "Broker connections lost and re-established"),
        (&TASKS_PROCESSED, "tasks_processed", "Tasks searched by this worker"),
    ];
    for (handle, name, description) in counters {
        let _ = handle.set(
            meter
                .u64_counter(name)
                .with_description(description)
                .build(),
        );
    }

    let _ = TASK_DURATION_MS.set(
        meter
            .f64_histogram("task_duration")
            .with_unit("ms")
            .with_description("Time spent searching one partition")
            .build(),
    );
}

#[cfg(feature = "metrics")]
fn add(counter: &OnceLock<Counter<u64>>, count: u64) {
    if let Some(counter) = counter.get() {
        counter.add(count, &[]);
    }
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_requests_created() {
    add(&REQUESTS_CREATED, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests_created() {}

#[cfg(feature = "metrics")]
pub fn increment_requests_rejected() {
    add(&REQUESTS_REJECTED, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests_rejected() {}

#[cfg(feature = "metrics")]
pub fn increment_requests_expired(count: u64) {
    add(&REQUESTS_EXPIRED, count);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests_expired(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_tasks_published(count: u64) {
    add(&TASKS_PUBLISHED, count);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_tasks_published(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_publish_failures() {
    add(&PUBLISH_FAILURES, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_publish_failures() {}

#[cfg(feature = "metrics")]
pub fn increment_responses_ingested() {
    add(&RESPONSES_INGESTED, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_responses_ingested() {}

#[cfg(feature = "metrics")]
pub fn increment_malformed_payloads() {
    add(&MALFORMED_PAYLOADS, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_malformed_payloads() {}

#[cfg(feature = "metrics")]
pub fn increment_reconnects() {
    add(&RECONNECTS, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_reconnects() {}

#[cfg(feature = "metrics")]
pub fn increment_tasks_processed() {
    add(&TASKS_PROCESSED, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_tasks_processed() {}

#[cfg(feature = "metrics")]
pub fn record_task_duration(duration_ms: f64) {
    if let Some(histogram) = TASK_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_task_duration(_duration_ms: f64) {}
