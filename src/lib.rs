pub mod collectors;
pub mod config;
pub mod decoder;
pub mod error;
pub mod exporter;
pub mod processing;
pub mod telemetry;

// Re-export commonly used types
pub use collectors::{CollectorCache, CollectorConfig};
pub use config::Config;
pub use decoder::DeliveryBatch;
pub use error::ForwarderError;
pub use exporter::ExportOutcome;
pub use processing::InvocationSummary;

use lambda_runtime::Error as LambdaError;
use reqwest::Client as ReqwestClient;

/// Shared application state across Lambda invocations.
///
/// Built once per execution environment; the collector cache inside it is
/// the only state that survives warm starts.
pub struct AppState {
    pub http_client: ReqwestClient,
    pub collectors: CollectorCache,
    pub config: Config,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self, LambdaError> {
        let aws_config = aws_config::load_from_env().await;
        let secrets_client = aws_sdk_secretsmanager::Client::new(&aws_config);

        Ok(Self {
            http_client: ReqwestClient::new(),
            collectors: CollectorCache::new(secrets_client, &config),
            config,
        })
    }
}
