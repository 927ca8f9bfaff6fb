//! Error types for the control-plane client

use keel_core::Code;
use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to the control plane
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the API
        message: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        self.code() == Code::NotFound
    }

    /// Classify the failure
    pub fn code(&self) -> Code {
        match self {
            Self::RequestFailed(e) if e.is_timeout() => Code::DeadlineExceeded,
            Self::RequestFailed(e) if e.is_connect() || e.is_request() => Code::Unavailable,
            Self::RequestFailed(e) => match e.status() {
                Some(status) => code_for_status(status.as_u16()),
                None => Code::Internal,
            },
            Self::ApiError { status, .. } => code_for_status(*status),
            Self::ParseError(_) => Code::Internal,
            Self::NotFound(_) => Code::NotFound,
            Self::InvalidRequest(_) => Code::InvalidArgument,
        }
    }
}

/// Map an HTTP status onto the shared error taxonomy
pub fn code_for_status(status: u16) -> Code {
    match status {
        400 | 422 => Code::InvalidArgument,
        404 => Code::NotFound,
        409 => Code::AlreadyExists,
        412 => Code::FailedPrecondition,
        408 | 504 => Code::DeadlineExceeded,
        502 | 503 => Code::Unavailable,
        501 => Code::Unimplemented,
        _ => Code::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(code_for_status(404), Code::NotFound);
        assert_eq!(code_for_status(400), Code::InvalidArgument);
        assert_eq!(code_for_status(422), Code::InvalidArgument);
        assert_eq!(code_for_status(409), Code::AlreadyExists);
        assert_eq!(code_for_status(503), Code::Unavailable);
        assert_eq!(code_for_status(504), Code::DeadlineExceeded);
        assert_eq!(code_for_status(500), Code::Internal);
    }

    #[test]
    fn test_api_errors_carry_code() {
        let err = ClientError::api_error(503, "draining");
        assert_eq!(err.code(), Code::Unavailable);
        assert!(err.code().is_retryable());

        let err = ClientError::api_error(404, "no such deployment");
        assert!(err.is_not_found());
        assert!(!err.code().is_retryable());
    }
}
