use std::sync::Arc;

use axum::{
    extract::{Extension, Json, State},
    http::{HeaderMap, StatusCode},
};
use serde_json::{json, Value};
use tracing::debug;

use shared_config::AppConfig;
use shared_models::auth::{TokenResponse, User};
use shared_models::error::AppError;
use shared_utils::extractor::bearer_token;
use shared_utils::jwt::validate_token as decode_token;

use crate::models::{AuthSession, LoginRequest, SignupRequest, SignupResponse};
use crate::services::AuthService;

pub struct AuthState {
    pub config: Arc<AppConfig>,
    pub auth: AuthService,
}

impl AuthState {
    pub fn new(config: Arc<AppConfig>, auth: AuthService) -> Self {
        Self { config, auth }
    }
}

pub async fn login(
    State(state): State<Arc<AuthState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<AuthSession>, AppError> {
    let session = state.auth.sign_in(&request.email, &request.password).await?;
    Ok(Json(session))
}

pub async fn signup(
    State(state): State<Arc<AuthState>>,
    Json(request): Json<SignupRequest>,
) -> Result<(StatusCode, Json<SignupResponse>), AppError> {
    let response = state
        .auth
        .sign_up(&request.email, &request.password, &request.full_name)
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn validate_token(
    State(state): State<Arc<AuthState>>,
    headers: HeaderMap,
) -> Result<Json<TokenResponse>, AppError> {
    debug!("Validating token");

    let token = bearer_token(&headers)?;
    let user = decode_token(token, &state.config.supabase_jwt_secret).map_err(AppError::Auth)?;

    Ok(Json(TokenResponse {
        valid: true,
        user_id: user.id,
        email: user.email,
        role: user.role,
    }))
}

pub async fn verify_token(
    State(state): State<Arc<AuthState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    debug!("Verifying token");

    let token = bearer_token(&headers)?;
    let valid = decode_token(token, &state.config.supabase_jwt_secret).is_ok();

    Ok(Json(json!({ "valid": valid })))
}

pub async fn get_profile(
    State(state): State<Arc<AuthState>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    debug!("Getting profile for user: {}", user.id);

    let token = bearer_token(&headers)?;
    let profile = state.auth.get_profile(token).await?;

    Ok(Json(json!({
        "user_id": user.id,
        "email": profile.email,
        "full_name": profile.full_name().or(user.full_name()),
        "created_at": profile.created_at
    })))
}
