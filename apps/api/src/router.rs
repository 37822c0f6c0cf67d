use std::sync::Arc;

use axum::{routing::get, Router};

use auth_cell::handlers::AuthState;
use auth_cell::{auth_routes, AuthService};
use patient_cell::handlers::PatientState;
use patient_cell::{create_patient_router, AccountService, PatientService};
use shared_config::AppConfig;
use shared_database::{BackendGateway, ChangeFeed, QueryCache, SupabaseClient};
use visit_cell::handlers::VisitState;
use visit_cell::{create_visit_router, ClinicCalendar, QueueSyncService, VisitService};

/// Backend handles shared by every cell.
pub struct Backend {
    pub client: SupabaseClient,
    pub feed: Arc<dyn ChangeFeed>,
}

/// Builds every cell on one query cache and one clinic calendar, so queue
/// sync invalidates the same views the visit routes read.
pub fn create_router(config: Arc<AppConfig>, backend: Backend) -> Router {
    let gateway: Arc<dyn BackendGateway> = Arc::new(backend.client.clone());
    create_router_with(config, backend.client, gateway, backend.feed)
}

fn create_router_with(
    config: Arc<AppConfig>,
    client: SupabaseClient,
    gateway: Arc<dyn BackendGateway>,
    feed: Arc<dyn ChangeFeed>,
) -> Router {
    let cache = QueryCache::with_capacity(config.cache_max_entries);
    let calendar = ClinicCalendar::from_config(&config);

    let visits = VisitService::new(Arc::clone(&gateway), cache.clone(), calendar.clone(), &config);
    let sync = QueueSyncService::new(feed, cache.clone(), calendar);
    let visit_state = VisitState::new(Arc::clone(&config), visits, sync);

    let patient_state = PatientState::new(
        Arc::clone(&config),
        PatientService::new(Arc::clone(&gateway)),
        AccountService::new(gateway, cache),
    );

    let auth_state = AuthState::new(Arc::clone(&config), AuthService::new(client));

    Router::new()
        .route("/", get(|| async { "MCMS clinic API is running!" }))
        .nest("/auth", auth_routes(Arc::new(auth_state)))
        .nest("/visits", create_visit_router(Arc::new(visit_state)))
        .nest("/patients", create_patient_router(Arc::new(patient_state)))
}
