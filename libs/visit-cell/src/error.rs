use thiserror::Error;

use shared_database::GatewayError;
use shared_models::error::AppError;

use crate::models::VisitStatus;

#[derive(Error, Debug)]
pub enum VisitError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Visit not found: {0}")]
    NotFound(String),

    #[error("Invalid visit status transition from {from} to {to}")]
    InvalidTransition { from: VisitStatus, to: VisitStatus },

    #[error("Visit was changed concurrently: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl From<VisitError> for AppError {
    fn from(err: VisitError) -> Self {
        match err {
            VisitError::Validation(msg) => AppError::ValidationError(msg),
            VisitError::InvalidTransition { .. } => AppError::ValidationError(err.to_string()),
            VisitError::NotFound(msg) => AppError::NotFound(msg),
            VisitError::Conflict(msg) => AppError::Conflict(msg),
            VisitError::Serialization(e) => AppError::Internal(format!("Malformed visit row: {}", e)),
            VisitError::Gateway(e) => AppError::from(e),
        }
    }
}
