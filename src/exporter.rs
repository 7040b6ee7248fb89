//! Export of decoded trace payloads to a collector endpoint.
//!
//! Payloads destined for the same collector are merged by concatenating
//! their `resource_spans` and split into outbound requests bounded by a
//! byte budget and a payload count; an oversized single payload still ships
//! as its own request rather than being truncated. Requests are serialized
//! per the collector's protocol, optionally gzipped, and sent with a
//! bounded retry budget and exponential backoff.

use std::io::Write;
use std::time::Duration;

use flate2::{write::GzEncoder, Compression};
use opentelemetry::trace::SpanKind;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use prost::Message;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client as ReqwestClient, StatusCode};
use tracing::instrument;

use crate::collectors::CollectorConfig;
use crate::config::{Config, OtlpProtocol};
use crate::error::ForwarderError;

/// Result of exporting one group of payloads to one collector.
#[derive(Debug)]
pub enum ExportOutcome {
    /// Every constituent request succeeded.
    Success,
    /// Some requests failed after retry exhaustion; the rest were delivered.
    PartialFailure {
        failed_requests: usize,
        failed_payloads: usize,
        last_error: String,
    },
    /// No request got through.
    Failure { error: String },
}

impl ExportOutcome {
    pub fn is_total_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    /// Payloads known to be lost under this outcome, given the group size.
    pub fn failed_payloads(&self, group_size: usize) -> usize {
        match self {
            Self::Success => 0,
            Self::PartialFailure {
                failed_payloads, ..
            } => *failed_payloads,
            Self::Failure { .. } => group_size,
        }
    }
}

/// One outbound request's worth of merged payloads.
struct Chunk {
    request: ExportTraceServiceRequest,
    payloads: usize,
}

/// Exports a group of payloads to one collector.
///
/// Requests within the group run sequentially; concurrency lives at the
/// group level in the orchestrator.
#[instrument(skip_all, fields(
    otel.kind = ?SpanKind::Client,
    http.url = %collector.endpoint,
    forwarder.export.payloads = payloads.len(),
    forwarder.export.requests,
))]
pub async fn export(
    client: &ReqwestClient,
    collector: &CollectorConfig,
    payloads: Vec<ExportTraceServiceRequest>,
    config: &Config,
) -> ExportOutcome {
    let group_size = payloads.len();
    let chunks = build_chunks(
        payloads,
        config.max_request_bytes,
        config.max_request_payloads,
    );
    tracing::Span::current().record("forwarder.export.requests", chunks.len());

    let total_requests = chunks.len();
    let mut failed_requests = 0;
    let mut failed_payloads = 0;
    let mut last_error = None;

    for chunk in chunks {
        match send_chunk(client, collector, &chunk, config).await {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(
                    endpoint = %collector.endpoint,
                    payloads = chunk.payloads,
                    error = %e,
                    "export request failed"
                );
                failed_requests += 1;
                failed_payloads += chunk.payloads;
                last_error = Some(e.to_string());
            }
        }
    }

    match (failed_requests, last_error) {
        (0, _) => ExportOutcome::Success,
        (n, Some(error)) if n == total_requests => ExportOutcome::Failure { error },
        (_, Some(last_error)) => ExportOutcome::PartialFailure {
            failed_requests,
            failed_payloads,
            last_error,
        },
        // failed_requests > 0 always records an error
        (_, None) => ExportOutcome::Failure {
            error: format!("{failed_payloads} of {group_size} payloads lost"),
        },
    }
}

/// Merges payloads into outbound requests bounded by size and count.
fn build_chunks(
    payloads: Vec<ExportTraceServiceRequest>,
    max_bytes: usize,
    max_payloads: usize,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current = ExportTraceServiceRequest::default();
    let mut current_payloads = 0;
    let mut current_bytes = 0;

    for payload in payloads {
        let payload_bytes = payload.encoded_len();
        let would_overflow = current_payloads > 0
            && (current_bytes + payload_bytes > max_bytes || current_payloads + 1 > max_payloads);

        if would_overflow {
            chunks.push(Chunk {
                request: std::mem::take(&mut current),
                payloads: current_payloads,
            });
            current_payloads = 0;
            current_bytes = 0;
        }

        current.resource_spans.extend(payload.resource_spans);
        current_payloads += 1;
        current_bytes += payload_bytes;
    }

    if current_payloads > 0 {
        chunks.push(Chunk {
            request: current,
            payloads: current_payloads,
        });
    }

    chunks
}

#[instrument(skip_all, fields(http.status_code, forwarder.export.attempts))]
async fn send_chunk(
    client: &ReqwestClient,
    collector: &CollectorConfig,
    chunk: &Chunk,
    config: &Config,
) -> Result<(), ForwarderError> {
    let body = serialize_request(&chunk.request, collector.protocol, config.compress_exports)
        .map_err(|reason| ForwarderError::Export {
            endpoint: collector.endpoint.to_string(),
            reason,
        })?;
    let headers = build_headers(collector, config.compress_exports)?;

    let current_span = tracing::Span::current();
    let mut last_error = String::new();

    for attempt in 0..config.export_attempts {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt)).await;
        }

        let response = client
            .post(collector.endpoint.clone())
            .headers(headers.clone())
            .timeout(config.export_timeout)
            .body(body.clone())
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                current_span.record("http.status_code", status.as_u16());
                if status.is_success() {
                    current_span.record("forwarder.export.attempts", attempt + 1);
                    return Ok(());
                }

                let error_body = response.text().await.unwrap_or_default();
                last_error = format!("status {status}: {error_body}");
                if !is_retryable_status(status) {
                    break;
                }
            }
            // Connect failures and timeouts are retriable.
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(ForwarderError::Export {
        endpoint: collector.endpoint.to_string(),
        reason: last_error,
    })
}

fn serialize_request(
    request: &ExportTraceServiceRequest,
    protocol: OtlpProtocol,
    compress: bool,
) -> Result<Vec<u8>, String> {
    let bytes = match protocol {
        OtlpProtocol::HttpProtobuf => request.encode_to_vec(),
        OtlpProtocol::HttpJson => serde_json::to_vec(request)
            .map_err(|e| format!("failed to serialize request: {e}"))?,
    };

    if !compress {
        return Ok(bytes);
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&bytes)
        .and_then(|_| encoder.finish())
        .map_err(|e| format!("failed to compress request: {e}"))
}

/// Content headers per protocol plus the vendor's auth headers verbatim.
fn build_headers(
    collector: &CollectorConfig,
    compress: bool,
) -> Result<HeaderMap, ForwarderError> {
    let invalid_header = |e: String| ForwarderError::Export {
        endpoint: collector.endpoint.to_string(),
        reason: e,
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        HeaderValue::from_static(collector.protocol.content_type()),
    );
    if compress {
        headers.insert(
            reqwest::header::CONTENT_ENCODING,
            HeaderValue::from_static("gzip"),
        );
    }

    for (name, value) in &collector.headers {
        let header_name = name
            .to_lowercase()
            .parse::<HeaderName>()
            .map_err(|e| invalid_header(format!("invalid header name '{name}': {e}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| invalid_header(format!("invalid value for header '{name}': {e}")))?;
        headers.insert(header_name, header_value);
    }

    Ok(headers)
}

fn is_retryable_status(status: StatusCode) -> bool {
    match status.as_u16() {
        408 | 429 => true,
        500..=599 => true,
        _ => false,
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(100 * 2u64.pow(attempt.saturating_sub(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::test_utils::sample_trace_request;
    use std::collections::HashMap;
    use url::Url;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_collector(endpoint: &str, protocol: OtlpProtocol) -> CollectorConfig {
        let mut headers = HashMap::new();
        headers.insert("x-api-key".to_string(), "test-key".to_string());
        CollectorConfig {
            endpoint: Url::parse(endpoint).unwrap(),
            headers,
            protocol,
        }
    }

    fn fast_config() -> Config {
        Config {
            export_attempts: 3,
            export_timeout: Duration::from_secs(2),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_export_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/traces"))
            .and(header("content-type", "application/x-protobuf"))
            .and(header("content-encoding", "gzip"))
            .and(header("x-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let collector = test_collector(
            &format!("{}/v1/traces", server.uri()),
            OtlpProtocol::HttpProtobuf,
        );
        let outcome = export(
            &ReqwestClient::new(),
            &collector,
            vec![sample_trace_request(), sample_trace_request()],
            &fast_config(),
        )
        .await;

        assert!(matches!(outcome, ExportOutcome::Success));
    }

    #[tokio::test]
    async fn test_export_json_protocol() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/traces"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let collector = test_collector(
            &format!("{}/v1/traces", server.uri()),
            OtlpProtocol::HttpJson,
        );
        let config = Config {
            compress_exports: false,
            ..fast_config()
        };
        let outcome = export(
            &ReqwestClient::new(),
            &collector,
            vec![sample_trace_request()],
            &config,
        )
        .await;

        assert!(matches!(outcome, ExportOutcome::Success));
    }

    #[tokio::test]
    async fn test_transient_failure_retried_to_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/traces"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/traces"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let collector = test_collector(
            &format!("{}/v1/traces", server.uri()),
            OtlpProtocol::HttpProtobuf,
        );
        let outcome = export(
            &ReqwestClient::new(),
            &collector,
            vec![sample_trace_request()],
            &fast_config(),
        )
        .await;

        assert!(matches!(outcome, ExportOutcome::Success));
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/traces"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let collector = test_collector(
            &format!("{}/v1/traces", server.uri()),
            OtlpProtocol::HttpProtobuf,
        );
        let outcome = export(
            &ReqwestClient::new(),
            &collector,
            vec![sample_trace_request()],
            &fast_config(),
        )
        .await;

        match outcome {
            ExportOutcome::Failure { error } => assert!(error.contains("503")),
            other => panic!("expected total failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/traces"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let collector = test_collector(
            &format!("{}/v1/traces", server.uri()),
            OtlpProtocol::HttpProtobuf,
        );
        let outcome = export(
            &ReqwestClient::new(),
            &collector,
            vec![sample_trace_request()],
            &fast_config(),
        )
        .await;

        assert!(outcome.is_total_failure());
    }

    #[tokio::test]
    async fn test_connection_failure_is_failure_outcome() {
        let collector =
            test_collector("http://127.0.0.1:9/v1/traces", OtlpProtocol::HttpProtobuf);
        let config = Config {
            export_attempts: 2,
            ..fast_config()
        };
        let outcome = export(
            &ReqwestClient::new(),
            &collector,
            vec![sample_trace_request()],
            &config,
        )
        .await;

        assert!(outcome.is_total_failure());
    }

    #[tokio::test]
    async fn test_oversized_group_splits_into_multiple_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/traces"))
            .respond_with(ResponseTemplate::new(200))
            .expect(3)
            .mount(&server)
            .await;

        let collector = test_collector(
            &format!("{}/v1/traces", server.uri()),
            OtlpProtocol::HttpProtobuf,
        );
        let config = Config {
            max_request_payloads: 2,
            ..fast_config()
        };
        let payloads = (0..6).map(|_| sample_trace_request()).collect();
        let outcome = export(&ReqwestClient::new(), &collector, payloads, &config).await;

        assert!(matches!(outcome, ExportOutcome::Success));
    }

    #[test]
    fn test_build_chunks_respects_byte_budget() {
        let payload = sample_trace_request();
        let payload_len = payload.encoded_len();
        let payloads = vec![payload.clone(), payload.clone(), payload];

        // Budget fits two payloads per request.
        let chunks = build_chunks(payloads, payload_len * 2, 64);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].payloads, 2);
        assert_eq!(chunks[1].payloads, 1);
    }

    #[test]
    fn test_build_chunks_never_drops_oversized_payload() {
        let payload = sample_trace_request();
        let chunks = build_chunks(vec![payload], 1, 64);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].payloads, 1);
    }

    #[test]
    fn test_retryable_status_classification() {
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
    }
}
