//! Error taxonomy shared by every gateway component.
//!
//! Each variant carries a stable machine-readable `kind` string and maps to a
//! single HTTP status. The enum is `Clone` so that one load failure can be
//! handed to every caller attached to that load.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Malformed, over-long or otherwise unusable model identifier
    #[error("invalid model identifier '{identifier}': {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    /// Request body or query rejected before any work was done
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown repository, file, download or instance
    #[error("not found: {0}")]
    NotFound(String),

    /// Downloaded artifact failed its size or checksum check
    #[error("integrity check failed for {path}: {reason}")]
    Integrity { path: String, reason: String },

    /// Transfer failed after all retries
    #[error("download failed: {0}")]
    DownloadFailed(String),

    /// Every interested caller went away, or an operator canceled the work
    #[error("canceled: {0}")]
    Canceled(String),

    /// Not enough free device memory right now; eviction may help
    #[error("insufficient device memory: need {needed} bytes, {available} bytes free")]
    InsufficientMemory { needed: u64, available: u64 },

    /// Eviction could not free enough memory
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    /// No device layout can ever host the instance
    #[error("placement failed: {0}")]
    Placement(String),

    /// Inference process failed to start or never became healthy
    #[error("instance failed to start: {0}")]
    InstanceStart(String),

    /// Instance still has in-flight requests or is mid-transition
    #[error("instance busy: {0}")]
    InstanceBusy(String),

    #[error("request timed out: {0}")]
    RequestTimeout(String),

    /// Registry or inference engine returned an unexpected response
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn invalid_identifier(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        GatewayError::InvalidIdentifier {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    /// Stable kind string exposed in every error response
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidIdentifier { .. } => "invalid_identifier",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Integrity { .. } => "integrity_error",
            GatewayError::DownloadFailed(_) => "download_failed",
            GatewayError::Canceled(_) => "canceled",
            GatewayError::InsufficientMemory { .. } => "insufficient_memory",
            GatewayError::ResourceExhausted(_) => "resource_exhausted",
            GatewayError::Placement(_) => "placement_error",
            GatewayError::InstanceStart(_) => "instance_start_error",
            GatewayError::InstanceBusy(_) => "instance_busy",
            GatewayError::RequestTimeout(_) => "request_timeout",
            GatewayError::Upstream(_) => "upstream_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidIdentifier { .. } | GatewayError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InstanceBusy(_)
            | GatewayError::Placement(_)
            | GatewayError::Canceled(_) => StatusCode::CONFLICT,
            GatewayError::InsufficientMemory { .. } | GatewayError::ResourceExhausted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Integrity { .. }
            | GatewayError::DownloadFailed(_)
            | GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::InstanceStart(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// JSON body shared by plain error responses and terminal stream chunks
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
                "code": self.status_code().as_u16(),
            }
        })
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(format!("I/O error: {}", err))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::RequestTimeout(err.to_string())
        } else {
            GatewayError::Upstream(err.to_string())
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_json())).into_response()
    }
}
