use anyhow::Error as AnyhowError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Delivery error: {0}")]
    DeliveryError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Batch processing error: {0}")]
    BatchProcessingError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Redis error: {0}")]
    RedisError(String),

    #[error("Json parse error: {0}")]
    JsonParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Auth error: {0}")]
    AuthError(String),

    #[error("Server error: {0}")]
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::ProviderError(message) => (StatusCode::BAD_GATEWAY, message),
            AppError::DecodeError(message) => (StatusCode::UNPROCESSABLE_ENTITY, message),
            AppError::DeliveryError(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
            AppError::ValidationError(message) => (StatusCode::BAD_REQUEST, message),
            AppError::BatchProcessingError(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
            AppError::WebSocketError(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
            AppError::RedisError(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
            AppError::JsonParseError(message) => (StatusCode::BAD_REQUEST, message),
            AppError::ConfigError(message) => (StatusCode::BAD_REQUEST, message),
            AppError::AuthError(message) => (StatusCode::UNAUTHORIZED, message),
            AppError::ServerError(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };

        (status, error_message).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::JsonParseError(err.to_string())
    }
}

impl From<AnyhowError> for AppError {
    fn from(err: AnyhowError) -> Self {
        AppError::ServerError(err.to_string())
    }
}
