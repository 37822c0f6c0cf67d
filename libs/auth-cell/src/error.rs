use thiserror::Error;

use shared_database::GatewayError;
use shared_models::error::AppError;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Account already exists: {0}")]
    Conflict(String),

    #[error("Unexpected auth response: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Validation(msg) => AppError::ValidationError(msg),
            AuthError::InvalidCredentials => AppError::Auth(err.to_string()),
            AuthError::Conflict(msg) => AppError::Conflict(msg),
            AuthError::Serialization(e) => AppError::ExternalService(e.to_string()),
            AuthError::Gateway(e) => AppError::from(e),
        }
    }
}
