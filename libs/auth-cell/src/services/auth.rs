use serde_json::Value;
use tracing::{debug, info, warn};

use shared_database::{GatewayError, SupabaseClient};
use shared_utils::validation::{InputValidator, MIN_PASSWORD_LENGTH};

use crate::error::AuthError;
use crate::models::{AuthSession, AuthUser, SignupResponse};

const INVALID_CREDENTIALS: &str = "Invalid login credentials";

pub const ACTIVATION_NOTICE: &str =
    "Registration received. Please contact an administrator to activate your account.";

#[derive(Clone)]
pub struct AuthService {
    client: SupabaseClient,
    validator: InputValidator,
}

impl AuthService {
    pub fn new(client: SupabaseClient) -> Self {
        Self {
            client,
            validator: InputValidator::new(),
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let email = email.trim();
        if !self.validator.is_email(email) {
            return Err(AuthError::Validation("A valid email address is required".to_string()));
        }
        if password.is_empty() {
            return Err(AuthError::Validation("Password is required".to_string()));
        }

        debug!("Signing in {}", email);
        let session = self
            .client
            .sign_in_with_password(email, password)
            .await
            .map_err(|e| match e {
                GatewayError::Rejected { ref message, .. } | GatewayError::Unauthorized(ref message)
                    if message == INVALID_CREDENTIALS =>
                {
                    warn!("Rejected sign-in for {}", email);
                    AuthError::InvalidCredentials
                }
                other => AuthError::from(other),
            })?;

        Ok(serde_json::from_value(session)?)
    }

    /// Registers a staff account. New accounts stay inactive until an
    /// administrator enables them.
    pub async fn sign_up(&self, email: &str, password: &str, full_name: &str) -> Result<SignupResponse, AuthError> {
        let email = email.trim();
        let full_name = full_name.trim();
        if !self.validator.is_email(email) {
            return Err(AuthError::Validation("A valid email address is required".to_string()));
        }
        if password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(AuthError::Validation(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LENGTH
            )));
        }
        if full_name.is_empty() {
            return Err(AuthError::Validation("Full name is required".to_string()));
        }

        let response = self
            .client
            .sign_up(email, password, full_name)
            .await
            .map_err(|e| match e {
                GatewayError::Rejected { status: 422, message } | GatewayError::Conflict(message) => {
                    AuthError::Conflict(message)
                }
                other => AuthError::from(other),
            })?;

        // With email confirmation on, the auth service answers with the bare
        // user; otherwise it wraps it in a session.
        let user = match response {
            Value::Object(mut body) if body.contains_key("user") => {
                body.remove("user").unwrap_or(Value::Null)
            }
            other => other,
        };
        let user: AuthUser = serde_json::from_value(user)?;
        info!("Registered user {}", user.id);

        Ok(SignupResponse {
            user_id: user.id,
            email: user.email,
            message: ACTIVATION_NOTICE.to_string(),
        })
    }

    pub async fn get_profile(&self, auth_token: &str) -> Result<AuthUser, AuthError> {
        let profile = self.client.get_user_profile(auth_token).await?;
        Ok(serde_json::from_value(profile)?)
    }
}
