use crate::config::ConfigError;
use crate::http::ServerError;
use crate::logging::LoggingError;

/// Errors that end the process.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("Failed to watch configuration: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Logging(#[from] LoggingError),
}
