use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use shared_utils::extractor::auth_middleware;

use crate::handlers::{self, PatientState};

pub fn create_patient_router(state: Arc<PatientState>) -> Router {
    let public_routes = Router::new()
        .route("/verify-signup", post(handlers::verify_signup));

    let protected_routes = Router::new()
        .route("/account", get(handlers::get_patient_account))
        .route("/account/link", post(handlers::link_account))
        .route("/{patient_id}", get(handlers::get_patient))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
