//! Error taxonomy shared by every control plane component
//!
//! Each variant maps onto one HTTP status. Internal and ad-decision failures
//! are logged with their detail and answered with a generic message.

use crate::storage::StorageError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors returned synchronously by control plane operations
#[derive(Debug, Error)]
pub enum ControlError {
    /// A required field is missing or malformed
    #[error("{0}")]
    Validation(String),

    /// The addressed encoder, configuration, or record does not exist
    #[error("{0}")]
    NotFound(String),

    /// A lifecycle transition was requested from an incompatible state
    #[error("{0}")]
    Conflict(String),

    /// The external ad decision server rejected or failed the request
    #[error("Ad decision failed: {0}")]
    AdDecision(String),

    /// Unexpected fault inside the control plane or a delegated backend
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Conflict(_) => StatusCode::CONFLICT,
            ControlError::AdDecision(_) => StatusCode::BAD_GATEWAY,
            ControlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to API callers
    pub fn public_message(&self) -> String {
        match self {
            ControlError::Validation(msg)
            | ControlError::NotFound(msg)
            | ControlError::Conflict(msg) => msg.clone(),
            ControlError::AdDecision(_) => "Ad decision failed".to_string(),
            ControlError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            ControlError::Internal(_) | ControlError::AdDecision(_) => {
                tracing::error!(error = %self, "request failed");
            }
            _ => {
                tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
            }
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

impl From<StorageError> for ControlError {
    fn from(e: StorageError) -> Self {
        ControlError::Internal(format!("configuration storage: {}", e))
    }
}

pub type ControlResult<T> = Result<T, ControlError>;
