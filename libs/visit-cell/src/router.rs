use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use shared_utils::extractor::auth_middleware;

use crate::handlers::{self, VisitState};

pub fn create_visit_router(state: Arc<VisitState>) -> Router {
    let protected_routes = Router::new()
        .route("/", get(handlers::list_visits).post(handlers::create_visit))
        .route("/queue", get(handlers::today_queue))
        .route("/queue/live", get(handlers::live_queue))
        .route("/{visit_id}", get(handlers::get_visit))
        .route("/{visit_id}/advance", post(handlers::advance_visit))
        .route("/{visit_id}/status", put(handlers::update_visit_status))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware));

    Router::new()
        .merge(protected_routes)
        .with_state(state)
}
