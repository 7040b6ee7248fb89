//! AWS Lambda function that forwards CloudWatch log wrapped OTLP records to
//! OpenTelemetry collectors.
//!
//! This Lambda function:
//! 1. Receives CloudWatch log events in otlp-stdout format
//! 2. Decodes and decompresses the log data
//! 3. Resolves each record's vendor to a collector via the credential cache
//! 4. Forwards the data to collectors in parallel
//!
//! The function supports:
//! - Per-vendor collector endpoints and authentication
//! - Base64 encoded, gzip compressed payloads
//! - Protobuf and JSON OTLP encodings
//! - OpenTelemetry instrumentation of its own pipeline

use std::sync::Arc;

use cloudwatch_otlp_forwarder::{processing, telemetry, AppState, Config, DeliveryBatch};
use lambda_runtime::{
    layers::{OpenTelemetryFaasTrigger, OpenTelemetryLayer as OtelLayer},
    Error as LambdaError, LambdaEvent, Runtime,
};
use serde_json::Value;
use tracing::instrument;

#[instrument(skip_all, name = "function_handler")]
async fn function_handler(
    event: LambdaEvent<Value>,
    state: Arc<AppState>,
) -> Result<(), LambdaError> {
    tracing::debug!("Function handler started");

    // A corrupt envelope fails the whole invocation; the subscription's
    // own redelivery policy takes it from there.
    let batch = DeliveryBatch::from_lambda_event(&event.payload)?;

    let summary = processing::process_batch(batch, &state).await;
    if summary.is_total_failure() {
        return Err(anyhow::anyhow!(
            "all {} export groups failed, {} payloads lost",
            summary.groups,
            summary.export_failures
        )
        .into());
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), LambdaError> {
    let config = Config::from_env()?;
    let tracer_provider = telemetry::init_telemetry(&config)?;

    // Initialize shared application state
    let state = Arc::new(AppState::new(config).await?);

    Runtime::new(lambda_runtime::service_fn(|event| {
        let state = Arc::clone(&state);
        async move { function_handler(event, state).await }
    }))
    .layer(
        OtelLayer::new(move || {
            if let Err(e) = tracer_provider.force_flush() {
                tracing::debug!("failed to flush spans: {e}");
            }
        })
        .with_trigger(OpenTelemetryFaasTrigger::PubSub),
    )
    .run()
    .await
}
