//! Error types for the NoETL Workflow Engine.
//!
//! This module provides custom error types that implement `IntoResponse`
//! for seamless integration with Axum handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level errors for the workflow engine.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Validation error (workflow input, action input, spec structure)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict error (e.g., duplicate resource)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Bad request error
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// NATS messaging error
    #[error("NATS error: {0}")]
    Nats(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Template or expression evaluation error
    #[error("Template error: {0}")]
    Template(String),

    /// Parse error (YAML, JSON, command strings, etc.)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Requested transition is not allowed from the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Task graph error (missing transition target, broken join)
    #[error("Workflow graph error: {0}")]
    Graph(String),

    /// Named lock could not be acquired
    #[error("Lock is held: {0}")]
    LockHeld(String),

    /// Action executor error
    #[error("Executor error: {0}")]
    Executor(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::InvalidState(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            AppError::Config(msg) => {
                tracing::error!(error = %msg, "Configuration error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            AppError::Nats(msg) => {
                tracing::error!(error = %msg, "NATS error");
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            AppError::Serialization(e) => {
                tracing::error!(error = %e, "Serialization error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::Template(msg) => {
                tracing::error!(error = %msg, "Template error");
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone())
            }
            AppError::Parse(msg) => {
                tracing::error!(error = %msg, "Parse error");
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            AppError::Graph(msg) => {
                tracing::error!(error = %msg, "Workflow graph error");
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone())
            }
            AppError::LockHeld(msg) => {
                tracing::warn!(error = %msg, "Named lock contention");
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            AppError::Executor(msg) => {
                tracing::warn!(error = %msg, "Executor error");
                (StatusCode::BAD_GATEWAY, msg.clone())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<envy::Error> for AppError {
    fn from(err: envy::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = AppError::NotFound("workflow execution abc".to_string());
        assert_eq!(err.to_string(), "Resource not found: workflow execution abc");
    }

    #[test]
    fn test_graph_error() {
        let err = AppError::Graph("task 'b' missing".to_string());
        assert_eq!(err.to_string(), "Workflow graph error: task 'b' missing");
    }

    #[test]
    fn test_invalid_state_maps_to_conflict() {
        let response = AppError::InvalidState("workflow is not running".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
