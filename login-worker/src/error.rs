use login_common::queue::SourceError;
use thiserror::Error;

/// Enumeration of errors that stop the worker. All of them happen at startup: once the worker
/// runs, failures are handled per batch or per message.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("failed to connect to the login store")]
    StoreConnectError(#[from] sqlx::Error),
    #[error("message source is not reachable")]
    SourceConnectError(#[from] SourceError),
    #[error("failed to install the metrics recorder")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
    #[error("failed to register a shutdown signal handler")]
    SignalError(#[from] std::io::Error),
}
