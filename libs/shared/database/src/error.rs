use thiserror::Error;

use shared_models::error::AppError;

/// Postgres unique-violation code, surfaced by PostgREST in the error body.
pub const UNIQUE_VIOLATION: &str = "23505";

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Conflict(String),

    #[error("Expected at most one row from {table}, got {count}")]
    MultipleRows { table: String, count: usize },

    #[error("Backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected response shape: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Realtime channel error: {0}")]
    Realtime(String),
}

impl GatewayError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, GatewayError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unauthorized(msg) => AppError::Auth(msg),
            GatewayError::NotFound(msg) => AppError::NotFound(msg),
            GatewayError::Conflict(msg) => AppError::Conflict(msg),
            GatewayError::Rejected { status, message } if status < 500 => {
                AppError::BadRequest(message)
            }
            other => AppError::ExternalService(other.to_string()),
        }
    }
}
