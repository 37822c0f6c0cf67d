use thiserror::Error;

use shared_database::GatewayError;
use shared_models::error::AppError;

#[derive(Error, Debug)]
pub enum PatientError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Patient not found: {0}")]
    NotFound(String),

    #[error("Account already linked: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl From<PatientError> for AppError {
    fn from(err: PatientError) -> Self {
        match err {
            PatientError::Validation(msg) => AppError::ValidationError(msg),
            PatientError::NotFound(msg) => AppError::NotFound(msg),
            PatientError::Conflict(msg) => AppError::Conflict(msg),
            PatientError::Serialization(e) => AppError::Internal(format!("Malformed patient row: {}", e)),
            PatientError::Gateway(e) => AppError::from(e),
        }
    }
}
