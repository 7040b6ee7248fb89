//! Decoding of CloudWatch Logs subscription deliveries into OTLP payloads.
//!
//! A delivery arrives as `{"awslogs": {"data": "<base64(gzip(json))>"}}`.
//! The inner JSON carries the log group and an ordered list of log events.
//! Only events whose message body is a JSON object with the
//! `__otel_otlp_stdout` marker are telemetry-bearing; everything else is
//! skipped silently since plain log lines share the subscription.
//!
//! Decoding is one pass and retains no state: `decode_records` yields a lazy
//! sequence of per-record results so a corrupt record never disturbs its
//! neighbours.

use std::io::Read;
use std::sync::OnceLock;

use base64::{engine::general_purpose, Engine};
use flate2::read::GzDecoder;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use prost::Message;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::config::Config;
use crate::error::ForwarderError;

/// Marker field identifying an OTLP-bearing log record. Matches the
/// CloudWatch subscription filter pattern.
pub const OTLP_STDOUT_MARKER: &str = "__otel_otlp_stdout";

const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_PROTOBUF: &str = "application/x-protobuf";
const ENCODING_GZIP: &str = "gzip";

/// One delivery from the log subscription, decoded from the transport
/// envelope. Immutable for the invocation's lifetime.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryBatch {
    #[serde(default)]
    pub owner: String,
    pub log_group: String,
    #[serde(default)]
    pub log_stream: String,
    #[serde(default)]
    pub message_type: String,
    pub log_events: Vec<LogEvent>,
}

/// One delivered log line.
#[derive(Debug, Deserialize)]
pub struct LogEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: i64,
    pub message: String,
}

/// The JSON body written by the otlp-stdout span exporters.
#[derive(Debug, Deserialize)]
struct StdoutRecord {
    #[serde(rename = "__otel_otlp_stdout")]
    #[allow(dead_code)]
    marker: String,
    #[serde(default)]
    source: String,
    payload: Value,
    #[serde(rename = "content-type", default = "default_content_type")]
    content_type: String,
    #[serde(rename = "content-encoding", default)]
    content_encoding: Option<String>,
    #[serde(default)]
    base64: Option<bool>,
    /// Explicit destination hint; wins over log-group derivation.
    #[serde(default)]
    vendor: Option<String>,
}

fn default_content_type() -> String {
    CONTENT_TYPE_JSON.to_string()
}

/// A decoded OTLP trace payload, tagged with the vendor it belongs to.
#[derive(Debug)]
pub struct SpanPayload {
    pub vendor: String,
    pub source: String,
    pub request: ExportTraceServiceRequest,
}

impl DeliveryBatch {
    /// Decodes the raw Lambda payload into a `DeliveryBatch`.
    ///
    /// Any failure in the envelope chain (missing fields, bad base64, bad
    /// gzip, bad JSON) is a `MalformedBatch`: no individual record can be
    /// salvaged from a corrupt envelope.
    pub fn from_lambda_event(payload: &Value) -> Result<Self, ForwarderError> {
        let data = payload
            .get("awslogs")
            .and_then(|l| l.get("data"))
            .and_then(Value::as_str)
            .ok_or_else(|| ForwarderError::malformed("no 'awslogs.data' field in payload"))?;

        let compressed = general_purpose::STANDARD
            .decode(data)
            .map_err(|e| ForwarderError::malformed(format!("invalid base64 envelope: {e}")))?;

        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut decompressed = String::new();
        decoder
            .read_to_string(&mut decompressed)
            .map_err(|e| ForwarderError::malformed(format!("failed to decompress envelope: {e}")))?;

        serde_json::from_str(&decompressed)
            .map_err(|e| ForwarderError::malformed(format!("invalid log data: {e}")))
    }
}

/// Lazily decodes the batch into `(vendor, payload)` pairs.
///
/// Non-OTLP records yield nothing; marker-bearing records that fail to
/// decode yield `Err` so the caller can count them without aborting.
pub fn decode_records<'a>(
    batch: &'a DeliveryBatch,
    config: &'a Config,
) -> impl Iterator<Item = Result<SpanPayload, ForwarderError>> + 'a {
    batch
        .log_events
        .iter()
        .filter_map(move |event| decode_record(event, &batch.log_group, config))
}

/// Decodes one log event. Returns `None` for records that are not
/// OTLP-bearing (non-JSON bodies, missing marker).
fn decode_record(
    event: &LogEvent,
    log_group: &str,
    config: &Config,
) -> Option<Result<SpanPayload, ForwarderError>> {
    let body: Value = serde_json::from_str(&event.message).ok()?;
    body.get(OTLP_STDOUT_MARKER)?;

    Some(decode_marked_record(body, log_group, config))
}

fn decode_marked_record(
    body: Value,
    log_group: &str,
    config: &Config,
) -> Result<SpanPayload, ForwarderError> {
    let record: StdoutRecord = serde_json::from_value(body)
        .map_err(|e| ForwarderError::decode(format!("invalid otlp-stdout record: {e}")))?;

    let vendor = match &record.vendor {
        Some(hint) => hint.clone(),
        None => normalize_log_group(log_group),
    };

    let bytes = decode_payload(&record, config.max_record_bytes)?;
    let request = parse_trace_request(&bytes, &record.content_type)?;

    Ok(SpanPayload {
        vendor,
        source: record.source,
        request,
    })
}

/// Extracts the raw payload bytes: base64 decode when flagged, gunzip when
/// the record says so. Idempotent; touches no shared state.
fn decode_payload(record: &StdoutRecord, max_bytes: usize) -> Result<Vec<u8>, ForwarderError> {
    let raw = match &record.payload {
        Value::String(s) => {
            if record.base64.unwrap_or(false) {
                general_purpose::STANDARD
                    .decode(s)
                    .map_err(|e| ForwarderError::decode(format!("invalid base64 payload: {e}")))?
            } else {
                s.clone().into_bytes()
            }
        }
        // Inline JSON payload, as emitted by the stdout exporter when
        // neither compression nor protobuf is in play.
        other => serde_json::to_vec(other)
            .map_err(|e| ForwarderError::decode(format!("unserializable payload: {e}")))?,
    };

    let bytes = if record.content_encoding.as_deref() == Some(ENCODING_GZIP)
        && record.payload.is_string()
    {
        let mut decoder = GzDecoder::new(&raw[..]);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| ForwarderError::decode(format!("failed to decompress payload: {e}")))?;
        decompressed
    } else {
        raw
    };

    if bytes.len() > max_bytes {
        return Err(ForwarderError::decode(format!(
            "payload of {} bytes exceeds the {} byte limit",
            bytes.len(),
            max_bytes
        )));
    }

    Ok(bytes)
}

fn parse_trace_request(
    bytes: &[u8],
    content_type: &str,
) -> Result<ExportTraceServiceRequest, ForwarderError> {
    match content_type {
        CONTENT_TYPE_PROTOBUF => ExportTraceServiceRequest::decode(bytes)
            .map_err(|e| ForwarderError::decode(format!("invalid protobuf payload: {e}"))),
        CONTENT_TYPE_JSON => serde_json::from_slice(bytes)
            .map_err(|e| ForwarderError::decode(format!("invalid JSON payload: {e}"))),
        other => Err(ForwarderError::decode(format!(
            "unsupported content type: {other}"
        ))),
    }
}

/// Derives a stable vendor key from a log-group name: last path segment,
/// environment prefix stripped, lowercased.
pub fn normalize_log_group(log_group: &str) -> String {
    static ENV_PREFIX: OnceLock<Regex> = OnceLock::new();
    let env_prefix = ENV_PREFIX
        .get_or_init(|| Regex::new(r"^(dev|test|stage|staging|prod|production)[-_]").unwrap());

    let name = log_group
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(log_group);
    env_prefix.replace(&name.to_lowercase(), "").into_owned()
}


#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_roundtrip() {
        let inner = json!({
            "messageType": "DATA_MESSAGE",
            "owner": "123456789012",
            "logGroup": "/aws/lambda/prod-quote-service",
            "logStream": "2024/01/01/[$LATEST]abc",
            "logEvents": [
                {"id": "1", "timestamp": 1700000000000i64, "message": "plain line"}
            ]
        });

        let batch = DeliveryBatch::from_lambda_event(&lambda_event_payload(&inner)).unwrap();
        assert_eq!(batch.log_group, "/aws/lambda/prod-quote-service");
        assert_eq!(batch.log_events.len(), 1);
    }

    #[test]
    fn test_envelope_missing_data_is_malformed() {
        let err = DeliveryBatch::from_lambda_event(&json!({"awslogs": {}})).unwrap_err();
        assert!(matches!(err, ForwarderError::MalformedBatch(_)));
    }

    #[test]
    fn test_envelope_bad_base64_is_malformed() {
        let err =
            DeliveryBatch::from_lambda_event(&json!({"awslogs": {"data": "!!!"}})).unwrap_err();
        assert!(matches!(err, ForwarderError::MalformedBatch(_)));
    }

    #[test]
    fn test_envelope_not_gzip_is_malformed() {
        let data = general_purpose::STANDARD.encode(b"not gzip at all");
        let err =
            DeliveryBatch::from_lambda_event(&json!({"awslogs": {"data": data}})).unwrap_err();
        assert!(matches!(err, ForwarderError::MalformedBatch(_)));
    }

    #[test]
    fn test_empty_batch_yields_nothing() {
        let config = Config::default();
        let batch = batch_with_messages("/aws/lambda/prod-quote-service", vec![]);
        assert_eq!(decode_records(&batch, &config).count(), 0);
    }

    #[test]
    fn test_plain_lines_skipped_silently() {
        let config = Config::default();
        let batch = batch_with_messages(
            "/aws/lambda/prod-quote-service",
            vec![
                "START RequestId: abc".to_string(),
                json!({"level": "info", "msg": "hello"}).to_string(),
                "not json".to_string(),
            ],
        );
        assert_eq!(decode_records(&batch, &config).count(), 0);
    }

    #[test]
    fn test_decodes_marked_record() {
        let config = Config::default();
        let batch = batch_with_messages(
            "/aws/lambda/prod-quote-service",
            vec![stdout_record_message(None)],
        );

        let payloads: Vec<_> = decode_records(&batch, &config).collect();
        assert_eq!(payloads.len(), 1);
        let payload = payloads.into_iter().next().unwrap().unwrap();
        assert_eq!(payload.vendor, "quote-service");
        assert_eq!(payload.source, "test-service");
        assert_eq!(payload.request.resource_spans.len(), 1);
    }

    #[test]
    fn test_vendor_hint_wins_over_log_group() {
        let config = Config::default();
        let batch = batch_with_messages(
            "/aws/lambda/prod-quote-service",
            vec![stdout_record_message(Some("acme"))],
        );

        let payload = decode_records(&batch, &config)
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(payload.vendor, "acme");
    }

    #[test]
    fn test_corrupt_record_does_not_affect_others() {
        let config = Config::default();
        let mut corrupt = json!({
            OTLP_STDOUT_MARKER: "otlp-stdout-span-exporter@0.2.2",
            "payload": "%%% not base64 %%%",
            "content-type": "application/x-protobuf",
            "base64": true,
        });
        corrupt["source"] = json!("corrupt-service");

        let batch = batch_with_messages(
            "/aws/lambda/prod-quote-service",
            vec![
                stdout_record_message(None),
                corrupt.to_string(),
                stdout_record_message(None),
            ],
        );

        let results: Vec<_> = decode_records(&batch, &config).collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ForwarderError::Decode(_))));
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_invalid_protobuf_is_decode_error() {
        let config = Config::default();
        let garbage = general_purpose::STANDARD.encode(b"\xff\xfe\xfd definitely not protobuf");
        let message = json!({
            OTLP_STDOUT_MARKER: "otlp-stdout-span-exporter@0.2.2",
            "source": "svc",
            "payload": garbage,
            "content-type": "application/x-protobuf",
            "base64": true,
        })
        .to_string();

        let batch = batch_with_messages("/aws/lambda/svc", vec![message]);
        let results: Vec<_> = decode_records(&batch, &config).collect();
        assert!(matches!(results[0], Err(ForwarderError::Decode(_))));
    }

    #[test]
    fn test_oversized_record_is_decode_error() {
        let config = Config {
            max_record_bytes: 8,
            ..Config::default()
        };
        let batch = batch_with_messages(
            "/aws/lambda/prod-quote-service",
            vec![stdout_record_message(None)],
        );

        let results: Vec<_> = decode_records(&batch, &config).collect();
        assert!(matches!(results[0], Err(ForwarderError::Decode(_))));
    }

    #[test]
    fn test_inline_json_payload() {
        let config = Config::default();
        let request_json = serde_json::to_value(sample_trace_request()).unwrap();
        let message = json!({
            OTLP_STDOUT_MARKER: "otlp-stdout-client@0.2.2",
            "source": "json-service",
            "payload": request_json,
            "content-type": "application/json",
        })
        .to_string();

        let batch = batch_with_messages("/aws/lambda/json-service", vec![message]);
        let payload = decode_records(&batch, &config)
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(payload.vendor, "json-service");
        assert_eq!(payload.request.resource_spans.len(), 1);
    }

    #[test]
    fn test_normalize_log_group() {
        assert_eq!(
            normalize_log_group("/aws/lambda/prod-quote-service"),
            "quote-service"
        );
        assert_eq!(
            normalize_log_group("/aws/lambda/staging_orders"),
            "orders"
        );
        assert_eq!(normalize_log_group("plain-group"), "plain-group");
        assert_eq!(normalize_log_group("/aws/lambda/MyService"), "myservice");
    }
}
