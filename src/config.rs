//! Environment configuration for the forwarder.
//!
//! All knobs are plain environment variables with defaults, read once at
//! cold start and carried in the shared application state.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Environment variable names.
pub mod env_vars {
    /// Secret-store key prefix prepended to the vendor key.
    pub const SECRETS_KEY_PREFIX: &str = "COLLECTORS_SECRETS_KEY_PREFIX";

    /// Credential cache TTL in seconds.
    pub const CACHE_TTL_SECONDS: &str = "COLLECTORS_CACHE_TTL_SECONDS";

    /// Default export protocol ("http/protobuf" or "http/json").
    pub const OTLP_PROTOCOL: &str = "OTEL_EXPORTER_OTLP_PROTOCOL";

    /// Per-record decoded payload cap in bytes.
    pub const MAX_RECORD_BYTES: &str = "FORWARDER_MAX_RECORD_BYTES";

    /// Outbound request size budget before splitting.
    pub const MAX_REQUEST_BYTES: &str = "FORWARDER_MAX_REQUEST_BYTES";

    /// Maximum decoded payloads merged into one outbound request.
    pub const MAX_REQUEST_PAYLOADS: &str = "FORWARDER_MAX_REQUEST_PAYLOADS";

    /// Maximum in-flight export groups.
    pub const EXPORT_CONCURRENCY: &str = "FORWARDER_EXPORT_CONCURRENCY";

    /// Total tries per outbound request (first attempt included).
    pub const EXPORT_ATTEMPTS: &str = "FORWARDER_EXPORT_ATTEMPTS";

    /// Per-request export timeout in seconds.
    pub const EXPORT_TIMEOUT_SECONDS: &str = "FORWARDER_EXPORT_TIMEOUT_SECONDS";

    /// Secret fetch timeout in seconds.
    pub const SECRET_TIMEOUT_SECONDS: &str = "FORWARDER_SECRET_TIMEOUT_SECONDS";

    /// Outbound body compression ("gzip" or "none").
    pub const EXPORT_COMPRESSION: &str = "FORWARDER_EXPORT_COMPRESSION";

    /// Span processor mode for the forwarder's own spans ("sync" or "async").
    pub const PROCESSOR_MODE: &str = "OTEL_LAMBDA_SPAN_PROCESSOR_MODE";
}

/// OTLP encoding used on the wire towards a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OtlpProtocol {
    #[default]
    HttpProtobuf,
    HttpJson,
}

impl OtlpProtocol {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::HttpProtobuf => "application/x-protobuf",
            Self::HttpJson => "application/json",
        }
    }
}

impl FromStr for OtlpProtocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "http/protobuf" => Ok(Self::HttpProtobuf),
            "http/json" => Ok(Self::HttpJson),
            other => anyhow::bail!("unsupported OTLP protocol: {other}"),
        }
    }
}

impl fmt::Display for OtlpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpProtobuf => write!(f, "http/protobuf"),
            Self::HttpJson => write!(f, "http/json"),
        }
    }
}

/// How the forwarder's own spans are flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessorMode {
    /// Simple processor, spans exported synchronously at end of invocation.
    #[default]
    Sync,
    /// Batch processor, spans exported in the background.
    Async,
}

impl FromStr for ProcessorMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            other => anyhow::bail!("unsupported span processor mode: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub secrets_key_prefix: String,
    pub cache_ttl: Duration,
    pub default_protocol: OtlpProtocol,
    pub max_record_bytes: usize,
    pub max_request_bytes: usize,
    pub max_request_payloads: usize,
    pub export_concurrency: usize,
    pub export_attempts: u32,
    pub export_timeout: Duration,
    pub secret_fetch_timeout: Duration,
    pub compress_exports: bool,
    pub processor_mode: ProcessorMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secrets_key_prefix: "serverless-otlp-forwarder/keys/".to_string(),
            cache_ttl: Duration::from_secs(300),
            default_protocol: OtlpProtocol::HttpProtobuf,
            max_record_bytes: 1024 * 1024,
            max_request_bytes: 4 * 1024 * 1024,
            max_request_payloads: 64,
            export_concurrency: 4,
            export_attempts: 3,
            export_timeout: Duration::from_secs(10),
            secret_fetch_timeout: Duration::from_secs(5),
            compress_exports: true,
            processor_mode: ProcessorMode::Sync,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            secrets_key_prefix: env::var(env_vars::SECRETS_KEY_PREFIX)
                .unwrap_or(defaults.secrets_key_prefix),
            cache_ttl: Duration::from_secs(parse_env(
                env_vars::CACHE_TTL_SECONDS,
                defaults.cache_ttl.as_secs(),
            )?),
            default_protocol: parse_env(env_vars::OTLP_PROTOCOL, defaults.default_protocol)?,
            max_record_bytes: parse_env(env_vars::MAX_RECORD_BYTES, defaults.max_record_bytes)?,
            max_request_bytes: parse_env(env_vars::MAX_REQUEST_BYTES, defaults.max_request_bytes)?,
            max_request_payloads: parse_env(
                env_vars::MAX_REQUEST_PAYLOADS,
                defaults.max_request_payloads,
            )?,
            export_concurrency: parse_env(
                env_vars::EXPORT_CONCURRENCY,
                defaults.export_concurrency,
            )?,
            export_attempts: parse_env(env_vars::EXPORT_ATTEMPTS, defaults.export_attempts)?,
            export_timeout: Duration::from_secs(parse_env(
                env_vars::EXPORT_TIMEOUT_SECONDS,
                defaults.export_timeout.as_secs(),
            )?),
            secret_fetch_timeout: Duration::from_secs(parse_env(
                env_vars::SECRET_TIMEOUT_SECONDS,
                defaults.secret_fetch_timeout.as_secs(),
            )?),
            compress_exports: match env::var(env_vars::EXPORT_COMPRESSION) {
                Ok(value) => match value.trim().to_lowercase().as_str() {
                    "gzip" => true,
                    "none" => false,
                    other => anyhow::bail!("unsupported export compression: {other}"),
                },
                Err(_) => defaults.compress_exports,
            },
            processor_mode: parse_env(env_vars::PROCESSOR_MODE, defaults.processor_mode)?,
        })
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {name}: {value}")),
        Err(_) => Ok(default),
    }
}
