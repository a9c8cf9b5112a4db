use thiserror::Error;

/// Error types that can occur when talking to the chat completion provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport-level failure (connect, TLS, timeout, body read)
    #[error("HTTP error: {0}")]
    HttpError(String),
    /// The provider answered with a non-success status code
    #[error("Provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// API response parsing or format error
    #[error("Response format error: {message}. Raw response: {raw_response}")]
    ResponseFormatError {
        message: String,
        raw_response: String,
    },
    /// JSON serialization/deserialization errors
    #[error("JSON parse error: {0}")]
    JsonError(String),
    /// Invalid client configuration or request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// HTTP status code carried by the error, if the provider produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Converts reqwest HTTP errors into provider errors
impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ProviderError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => ProviderError::HttpError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::JsonError(format!(
            "{} at line {} column {}",
            err,
            err.line(),
            err.column()
        ))
    }
}
