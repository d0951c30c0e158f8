use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level errors for the `tpsctl` binary and embedding applications.
///
/// Allocation outcomes are never errors: rejections are values of
/// [`AllocationResult`](crate::allocation::AllocationResult). This type covers the process
/// around them: configuration, startup and I/O on the request stream. Startup failures that
/// carry their own context (database, carrier file) arrive as [`Error::Other`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }
}
