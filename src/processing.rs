//! The per-invocation pipeline: decode, resolve, export, summarize.
//!
//! The pipeline is a straight line. Errors are handled at the narrowest
//! scope: bad records are counted and skipped, unresolved vendors drop
//! their records, failed requests surface in the group outcome. Only a
//! malformed envelope (caught before this module) or a batch where every
//! export group failed turns into an invocation-level error. Redelivery of
//! a failed invocation would duplicate the spans that did go through, so
//! partial loss stays partial.

use std::collections::BTreeMap;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use tracing::instrument;

use crate::collectors::CollectorConfig;
use crate::decoder::{self, DeliveryBatch};
use crate::exporter::{self, ExportOutcome};
use crate::AppState;

/// Records grouped by resolved collector, ready for export.
struct ExportBatch {
    vendor: String,
    config: CollectorConfig,
    payloads: Vec<ExportTraceServiceRequest>,
}

/// Aggregated result of one invocation.
#[derive(Debug, Default)]
pub struct InvocationSummary {
    /// OTLP payloads delivered (or attempted in a partially failed group).
    pub processed: usize,
    /// Payloads dropped because their vendor could not be resolved.
    pub dropped: usize,
    /// Marker-bearing records whose payload failed to decode.
    pub decode_failures: usize,
    /// Payloads lost to failed export requests.
    pub export_failures: usize,
    /// Export groups attempted.
    pub groups: usize,
    /// Export groups where no request got through.
    pub groups_failed: usize,
}

impl InvocationSummary {
    /// The invocation is failed only when export was attempted and nothing
    /// was delivered anywhere.
    pub fn is_total_failure(&self) -> bool {
        self.groups > 0 && self.groups_failed == self.groups
    }
}

/// Runs the full pipeline over one delivery batch.
#[instrument(skip_all, fields(
    otel.kind = "consumer",
    forwarder.log_group = %batch.log_group,
    forwarder.events.count = batch.log_events.len(),
))]
pub async fn process_batch(batch: DeliveryBatch, state: &AppState) -> InvocationSummary {
    let mut summary = InvocationSummary::default();

    // Decoding: drain the lazy record sequence, grouping payloads by vendor.
    let mut pending: BTreeMap<String, Vec<ExportTraceServiceRequest>> = BTreeMap::new();
    for result in decoder::decode_records(&batch, &state.config) {
        match result {
            Ok(payload) => pending
                .entry(payload.vendor)
                .or_default()
                .push(payload.request),
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable record");
                summary.decode_failures += 1;
            }
        }
    }

    // Resolving: one lookup per distinct vendor, concurrently. The cache
    // deduplicates same-key fetches internally.
    let vendors: Vec<String> = pending.keys().cloned().collect();
    let resolutions = join_all(vendors.into_iter().map(|vendor| async move {
        let resolved = state.collectors.resolve(&vendor).await;
        (vendor, resolved)
    }))
    .await;

    let mut batches = Vec::new();
    for (vendor, resolved) in resolutions {
        let payloads = pending.remove(&vendor).unwrap_or_default();
        match resolved {
            Ok(config) => batches.push(ExportBatch {
                vendor,
                config,
                payloads,
            }),
            Err(e) => {
                tracing::warn!(vendor = %vendor, error = %e, "dropping records for unresolved vendor");
                summary.dropped += payloads.len();
            }
        }
    }

    // Exporting: groups run concurrently, bounded to respect connection
    // limits.
    summary.groups = batches.len();
    let outcomes: Vec<(String, usize, ExportOutcome)> = stream::iter(batches)
        .map(|batch| async move {
            let group_size = batch.payloads.len();
            let outcome =
                exporter::export(&state.http_client, &batch.config, batch.payloads, &state.config)
                    .await;
            (batch.vendor, group_size, outcome)
        })
        .buffer_unordered(state.config.export_concurrency.max(1))
        .collect()
        .await;

    for (vendor, group_size, outcome) in outcomes {
        let failed = outcome.failed_payloads(group_size);
        summary.processed += group_size - failed;
        summary.export_failures += failed;
        if outcome.is_total_failure() {
            summary.groups_failed += 1;
        }
        if let ExportOutcome::PartialFailure {
            failed_requests,
            last_error,
            ..
        } = &outcome
        {
            tracing::warn!(
                vendor = %vendor,
                failed_requests = failed_requests,
                last_error = %last_error,
                "partial export failure"
            );
        }
    }

    tracing::info!(
        processed = summary.processed,
        dropped = summary.dropped,
        decode_failures = summary.decode_failures,
        export_failures = summary.export_failures,
        groups = summary.groups,
        groups_failed = summary.groups_failed,
        "invocation summary"
    );

    summary
}
