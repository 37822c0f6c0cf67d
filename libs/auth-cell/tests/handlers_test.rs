use std::sync::Arc;

use assert_matches::assert_matches;
use axum::{extract::State, http::{HeaderMap, HeaderValue}};

use auth_cell::handlers::{validate_token, verify_token, AuthState};
use auth_cell::AuthService;
use shared_config::AppConfig;
use shared_database::SupabaseClient;
use shared_models::error::AppError;
use shared_utils::test_utils::{JwtTestUtils, TestConfig, TestUser};

fn create_test_state() -> Arc<AuthState> {
    let config: AppConfig = TestConfig::default().to_app_config();
    let auth = AuthService::new(SupabaseClient::new(&config));
    Arc::new(AuthState::new(Arc::new(config), auth))
}

fn create_auth_header(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
    );
    headers
}

#[tokio::test]
async fn test_validate_token_success() {
    let state = create_test_state();
    let user = TestUser::staff("nurse@clinic.test");
    let token = JwtTestUtils::create_test_token(&user, &state.config.supabase_jwt_secret, Some(24));

    let response = validate_token(State(state), create_auth_header(&token)).await.unwrap().0;

    assert!(response.valid);
    assert_eq!(response.user_id, user.id);
    assert_eq!(response.email, Some(user.email));
    assert_eq!(response.role, Some(user.role));
}

#[tokio::test]
async fn test_validate_token_missing_header() {
    let state = create_test_state();

    let result = validate_token(State(state), HeaderMap::new()).await;

    assert_matches!(result, Err(AppError::Auth(msg)) if msg == "Missing authorization header");
}

#[tokio::test]
async fn test_validate_token_invalid_scheme() {
    let state = create_test_state();
    let mut headers = HeaderMap::new();
    headers.insert("authorization", HeaderValue::from_static("Basic dXNlcjpwYXNz"));

    let result = validate_token(State(state), headers).await;

    assert_matches!(result, Err(AppError::Auth(msg)) if msg == "Invalid authorization header format");
}

#[tokio::test]
async fn test_validate_token_expired() {
    let state = create_test_state();
    let token = JwtTestUtils::create_expired_token(&TestUser::default(), &state.config.supabase_jwt_secret);

    let result = validate_token(State(state), create_auth_header(&token)).await;

    assert_matches!(result, Err(AppError::Auth(msg)) if msg == "Token expired");
}

#[tokio::test]
async fn test_validate_token_invalid_signature() {
    let state = create_test_state();
    let token = JwtTestUtils::create_invalid_signature_token(&TestUser::default());

    let result = validate_token(State(state), create_auth_header(&token)).await;

    assert_matches!(result, Err(AppError::Auth(msg)) if msg == "Invalid token signature");
}

#[tokio::test]
async fn test_validate_token_malformed() {
    let state = create_test_state();
    let token = JwtTestUtils::create_malformed_token();

    let result = validate_token(State(state), create_auth_header(&token)).await;

    assert_matches!(result, Err(AppError::Auth(_)));
}

#[tokio::test]
async fn test_verify_token_reports_validity() {
    let state = create_test_state();
    let user = TestUser::staff("doctor@clinic.test");
    let good = JwtTestUtils::create_test_token(&user, &state.config.supabase_jwt_secret, Some(24));
    let expired = JwtTestUtils::create_expired_token(&user, &state.config.supabase_jwt_secret);

    let response = verify_token(State(state.clone()), create_auth_header(&good)).await.unwrap().0;
    assert_eq!(response["valid"], true);

    let response = verify_token(State(state), create_auth_header(&expired)).await.unwrap().0;
    assert_eq!(response["valid"], false);
}

#[tokio::test]
async fn test_verify_token_still_requires_header() {
    let state = create_test_state();

    let result = verify_token(State(state), HeaderMap::new()).await;

    assert_matches!(result, Err(AppError::Auth(_)));
}
