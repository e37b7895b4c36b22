//! Error taxonomy for the agent.
//!
//! Command-level code uses `anyhow`; the components below return these typed
//! errors so the loop can decide whether to retry, report, or just log.

use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// Failures raised by the agent's components.
#[derive(Debug, Error)]
pub enum AgentError {
    /// config.json is missing fields or holds unusable values.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The device could not obtain an access token.
    #[error("Authentication failed: {0}")]
    AuthFailure(#[source] ApiError),

    /// The PFX could not be decoded, imported, or recorded.
    #[error("Install failed: {0}")]
    InstallFailure(String),

    /// A certificate could not be removed from the trust store.
    #[error("Failed to remove certificate {thumbprint}: {message}")]
    CleanupFailure { thumbprint: String, message: String },

    /// Sealed or plain state could not be read or written.
    #[error("Persistence failed for {}: {message}", path.display())]
    PersistenceFailure { path: PathBuf, message: String },
}

/// Failures talking to the CertHub API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} returned {status}")]
    Status { path: String, status: StatusCode },

    #[error("Invalid response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Response from {path} is missing {field}")]
    MissingField { path: String, field: &'static str },

    #[error("Invalid API base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// How an [`ApiError`] should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpFailure {
    /// Timeouts, connection errors, and 5xx responses.
    Transient,
    /// 429 Too Many Requests.
    RateLimited,
    /// 410, 409, or 403: the payload token is no longer usable.
    TokenRejected,
    /// 401 that survived a re-authentication attempt.
    Unauthorized,
    /// Anything else; not worth retrying.
    Rejected,
}

impl ApiError {
    /// HTTP status of the response, when one was received.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Transport { source, .. } | ApiError::Decode { source, .. } => source.status(),
            ApiError::MissingField { .. } | ApiError::InvalidUrl(_) => None,
        }
    }

    /// Classify for retry decisions around payload downloads.
    pub fn classify(&self) -> HttpFailure {
        match self {
            ApiError::Transport { .. } => HttpFailure::Transient,
            ApiError::Status { status, .. } => match *status {
                StatusCode::TOO_MANY_REQUESTS => HttpFailure::RateLimited,
                StatusCode::GONE | StatusCode::CONFLICT | StatusCode::FORBIDDEN => {
                    HttpFailure::TokenRejected
                }
                StatusCode::UNAUTHORIZED => HttpFailure::Unauthorized,
                s if s.is_server_error() => HttpFailure::Transient,
                _ => HttpFailure::Rejected,
            },
            ApiError::Decode { .. } | ApiError::MissingField { .. } | ApiError::InvalidUrl(_) => {
                HttpFailure::Rejected
            }
        }
    }
}
