use thiserror::Error;
use super::types::FileId;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error: status code {status_code}, message: {message}")]
    Server {
        status_code: u16,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("No upload session found for {0}")]
    NoSessionFound(FileId),

    #[error("Upload for {0} is already running")]
    AlreadyActive(FileId),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status_code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether another attempt of the same chunk transfer could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::Http(_) | UploadError::Server { .. } | UploadError::Internal(_)
        )
    }
}

impl From<reqwest::header::InvalidHeaderValue> for UploadError {
    fn from(err: reqwest::header::InvalidHeaderValue) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

impl From<reqwest::header::InvalidHeaderName> for UploadError {
    fn from(err: reqwest::header::InvalidHeaderName) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
