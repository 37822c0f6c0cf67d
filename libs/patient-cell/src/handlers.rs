use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use axum_extra::TypedHeader;
use headers::{authorization::Bearer, Authorization};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;
use shared_models::error::AppError;

use crate::models::{LinkAccountRequest, VerifySignupRequest};
use crate::services::{AccountService, PatientService};

pub struct PatientState {
    pub config: Arc<AppConfig>,
    pub patients: PatientService,
    pub accounts: AccountService,
}

impl PatientState {
    pub fn new(config: Arc<AppConfig>, patients: PatientService, accounts: AccountService) -> Self {
        Self { config, patients, accounts }
    }
}

#[axum::debug_handler]
pub async fn verify_signup(
    State(state): State<Arc<PatientState>>,
    Json(request): Json<VerifySignupRequest>,
) -> Result<Json<Value>, AppError> {
    let verified = state
        .accounts
        .verify_patient_for_signup(&request.national_id, &request.dob, &request.phone)
        .await?;

    Ok(Json(json!(verified)))
}

#[axum::debug_handler]
pub async fn get_patient_account(
    State(state): State<Arc<PatientState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let account = state.accounts.get_patient_account(&user.id, Some(auth.token())).await?;

    Ok(Json(json!({
        "linked": account.is_some(),
        "account": account
    })))
}

#[axum::debug_handler]
pub async fn link_account(
    State(state): State<Arc<PatientState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<LinkAccountRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    info!("User {} is linking a patient record", user.id);

    let account = state
        .accounts
        .link_account(&user, &request.national_id, Some(auth.token()))
        .await?;

    Ok((StatusCode::CREATED, Json(json!(account))))
}

#[axum::debug_handler]
pub async fn get_patient(
    State(state): State<Arc<PatientState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let patient = state.patients.get_patient_detail(patient_id, Some(auth.token())).await?;
    Ok(Json(json!(patient)))
}
