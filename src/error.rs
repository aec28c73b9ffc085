use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Application-level failure reported inside an upstream envelope
    /// (`errno`/`code` != 0).
    #[error("upstream error {code}: {message}")]
    Upstream { code: i64, message: String },

    #[error("Notifier error: {0}")]
    Notify(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Upstream error code meaning "topic not found"; drives the walker's
/// per-endpoint circuit breaker.
pub const TOPIC_NOT_FOUND: i64 = 10200;

impl AppError {
    pub fn is_topic_not_found(&self) -> bool {
        matches!(self, AppError::Upstream { code, .. } if *code == TOPIC_NOT_FOUND)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}
