//! Error taxonomy for the forwarder pipeline.
//!
//! Errors are contained at the narrowest scope that keeps the batch moving:
//! a `Decode` error skips one record, `UnknownVendor` and `SecretFetch` drop
//! one vendor's records, `Export` fails one outbound request. Only
//! `MalformedBatch` aborts the whole invocation, since nothing can be
//! salvaged from a corrupt envelope.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwarderError {
    /// The delivery envelope could not be decoded. Fatal for the invocation.
    #[error("malformed delivery batch: {0}")]
    MalformedBatch(String),

    /// A single log record carried the OTLP marker but its payload could not
    /// be decoded. The record is skipped.
    #[error("failed to decode log record: {0}")]
    Decode(String),

    /// No secret is registered under the configured prefix for this vendor.
    #[error("no collector registered for vendor '{0}'")]
    UnknownVendor(String),

    /// The secret store was unreachable or returned malformed data.
    #[error("failed to fetch collector config for vendor '{vendor}': {reason}")]
    SecretFetch { vendor: String, reason: String },

    /// An outbound export request failed after exhausting its retry budget.
    #[error("export to {endpoint} failed: {reason}")]
    Export { endpoint: String, reason: String },
}

impl ForwarderError {
    pub fn malformed(context: impl std::fmt::Display) -> Self {
        Self::MalformedBatch(context.to_string())
    }

    pub fn decode(context: impl std::fmt::Display) -> Self {
        Self::Decode(context.to_string())
    }
}
