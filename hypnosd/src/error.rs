//! Service error taxonomy and its HTTP translation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Invalid or missing API key")]
    Unauthorized,
    #[error("Missing configuration: {0}")]
    Configuration(String),
    #[error("{message}")]
    Command {
        message: String,
        command: String,
        returncode: i32,
        stderr: String,
    },
    #[error("{0}")]
    Network(String),
}

impl ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Command { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ServiceError::Unauthorized => "Unauthorized",
            ServiceError::Configuration(_) => "ConfigurationError",
            ServiceError::Command { .. } => "SystemCommandError",
            ServiceError::Network(_) => "NetworkError",
        }
    }

    fn details(&self) -> serde_json::Value {
        match self {
            ServiceError::Command {
                command,
                returncode,
                stderr,
                ..
            } => json!({
                "command": command,
                "return_code": returncode,
                "stderr": stderr,
            }),
            _ => json!({}),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if !matches!(self, ServiceError::Unauthorized) {
            error!("{}: {}", self.kind(), self);
        }
        let body = json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "details": self.details(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
