//! Self-instrumentation bootstrap.
//!
//! The forwarder traces its own pipeline (decode counts, cache hits,
//! per-group export outcomes) through an OTLP span exporter configured via
//! the standard `OTEL_EXPORTER_OTLP_*` environment variables. The span
//! processor is either simple (spans flushed synchronously, safest in a
//! frozen-between-invocations environment) or batch, per configuration.

use std::env;
use std::time::Duration;

use anyhow::Result;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::trace::{BatchSpanProcessor, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing_subscriber::prelude::*;

use crate::config::{Config, ProcessorMode};

const TRACER_NAME: &str = "cloudwatch-otlp-forwarder";

fn service_name() -> String {
    env::var("OTEL_SERVICE_NAME")
        .or_else(|_| env::var("AWS_LAMBDA_FUNCTION_NAME"))
        .unwrap_or_else(|_| TRACER_NAME.to_string())
}

/// Builds the tracer provider and installs the global tracing subscriber.
///
/// Returns the provider so the runtime layer can flush it at the end of
/// each invocation.
pub fn init_telemetry(config: &Config) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_timeout(Duration::from_secs(3))
        .build()?;

    let resource = Resource::builder().with_service_name(service_name()).build();
    let builder = SdkTracerProvider::builder().with_resource(resource);
    let tracer_provider = match config.processor_mode {
        ProcessorMode::Sync => builder.with_simple_exporter(exporter),
        ProcessorMode::Async => {
            builder.with_span_processor(BatchSpanProcessor::builder(exporter).build())
        }
    }
    .build();

    opentelemetry::global::set_tracer_provider(tracer_provider.clone());

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let otel_layer =
        tracing_opentelemetry::OpenTelemetryLayer::new(tracer_provider.tracer(TRACER_NAME));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .without_time();

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(tracer_provider)
}
