use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::NaiveDate;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shared_config::AppConfig;
use shared_database::{BackendGateway, BroadcastChangeFeed, QueryCache, SupabaseClient};
use shared_utils::test_utils::{InMemoryGateway, JwtTestUtils, MockSupabaseResponses, TestConfig, TestUser};
use visit_cell::handlers::VisitState;
use visit_cell::{create_visit_router, ClinicCalendar, QueueSyncService, VisitService};

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
}

fn create_test_app(config: AppConfig, gateway: Arc<dyn BackendGateway>) -> Router {
    let cache = QueryCache::new();
    let calendar = ClinicCalendar::manual(today());
    let visits = VisitService::new(gateway, cache.clone(), calendar.clone(), &config);
    let sync = QueueSyncService::new(Arc::new(BroadcastChangeFeed::new()), cache, calendar);
    create_visit_router(Arc::new(VisitState::new(Arc::new(config), visits, sync)))
}

fn bearer(config: &AppConfig) -> String {
    let user = TestUser::staff("nurse@clinic.test");
    format!("Bearer {}", JwtTestUtils::create_test_token(&user, &config.supabase_jwt_secret, Some(1)))
}

async fn send(app: Router, method: &str, uri: &str, auth: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn seeded_gateway(status: &str) -> (InMemoryGateway, Uuid) {
    let gateway = InMemoryGateway::new();
    let id = Uuid::new_v4();
    gateway.seed("visits", vec![MockSupabaseResponses::visit_response(
        &id.to_string(),
        &Uuid::new_v4().to_string(),
        "2026-10-17",
        1,
        status,
    )]);
    (gateway, id)
}

#[tokio::test]
async fn test_routes_require_token() {
    let config = TestConfig::default().to_app_config();
    let app = create_test_app(config, Arc::new(InMemoryGateway::new()));

    let (status, body) = send(app, "GET", "/queue", None, None).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Missing authorization header");
}

#[tokio::test]
async fn test_create_visit_returns_created() {
    let config = TestConfig::default().to_app_config();
    let auth = bearer(&config);
    let app = create_test_app(config, Arc::new(InMemoryGateway::new()));

    let patient_id = Uuid::new_v4();
    let (status, body) = send(app, "POST", "/", Some(&auth), Some(json!({ "patient_id": patient_id }))).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["queue_number"], 1);
    assert_eq!(body["status"], "InQueue");
    assert_eq!(body["next_status"], "VitalSigns");
    assert_eq!(body["station"], "registration");
    assert_eq!(body["patient_id"], patient_id.to_string());
}

#[tokio::test]
async fn test_advance_and_assign() {
    let config = TestConfig::default().to_app_config();
    let auth = bearer(&config);
    let (gateway, id) = seeded_gateway("WaitingForDoctor");
    let app = create_test_app(config, Arc::new(gateway));

    let (status, body) = send(app.clone(), "POST", &format!("/{}/advance", id), Some(&auth), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "InConsultation");
    assert_eq!(body["allows_consultation"], true);

    let (status, body) = send(
        app.clone(),
        "PUT",
        &format!("/{}/status", id),
        Some(&auth),
        Some(json!({ "status": "PerformingProcedure" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["station"], "treatment");

    let (status, _) = send(
        app,
        "PUT",
        &format!("/{}/status", id),
        Some(&auth),
        Some(json!({ "status": "InQueue" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_completed_visit_has_no_next_status() {
    let config = TestConfig::default().to_app_config();
    let auth = bearer(&config);
    let (gateway, id) = seeded_gateway("Completed");
    let app = create_test_app(config, Arc::new(gateway));

    let (status, body) = send(app.clone(), "GET", &format!("/{}", id), Some(&auth), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["next_status"], Value::Null);

    let (status, body) = send(app, "POST", &format!("/{}/advance", id), Some(&auth), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("already Completed"));
}

#[tokio::test]
async fn test_unknown_visit_is_not_found() {
    let config = TestConfig::default().to_app_config();
    let auth = bearer(&config);
    let app = create_test_app(config, Arc::new(InMemoryGateway::new()));

    let (status, _) = send(app, "GET", &format!("/{}", Uuid::new_v4()), Some(&auth), None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_queue_board_and_filters() {
    let config = TestConfig::default().to_app_config();
    let auth = bearer(&config);
    let (gateway, _) = seeded_gateway("VitalSigns");
    let app = create_test_app(config, Arc::new(gateway));

    let (status, body) = send(app.clone(), "GET", "/queue?station=screening", Some(&auth), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["date"], "2026-10-17");
    assert_eq!(body["entries"].as_array().unwrap().len(), 1);
    assert_eq!(body["entries"][0]["patients"]["hn"], "HN000123");
    assert_eq!(body["total"], 1);

    let (status, _) = send(app.clone(), "GET", "/queue?station=pharmacy", Some(&auth), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(app.clone(), "GET", "/?date=2026-10-17&status=VitalSigns,InQueue", Some(&auth), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);

    let (status, _) = send(app, "GET", "/?status=Lost", Some(&auth), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_visit_against_supabase_retries_taken_number() {
    let server = MockServer::start().await;
    let config = TestConfig::with_url(&server.uri()).to_app_config();
    let auth = bearer(&config);
    let patient_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/visits"))
        .and(query_param("visit_date", "eq.2026-10-17"))
        .and(query_param("queue_number", "not.is.null"))
        .and(query_param("order", "queue_number.desc.nullslast"))
        .and(query_param("limit", "1"))
        .and(header("authorization", auth.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "queue_number": 3 }])))
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/visits"))
        .respond_with(ResponseTemplate::new(409).set_body_json(MockSupabaseResponses::error_response(
            "duplicate key value violates unique constraint \"visits_visit_date_queue_number_key\"",
            "23505",
        )))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let stored = MockSupabaseResponses::visit_response(
        &Uuid::new_v4().to_string(),
        &patient_id.to_string(),
        "2026-10-17",
        4,
        "InQueue",
    );
    Mock::given(method("POST"))
        .and(path("/rest/v1/visits"))
        .and(header("prefer", "return=representation"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([stored])))
        .mount(&server)
        .await;

    let client = SupabaseClient::new(&config);
    let app = create_test_app(config, Arc::new(client));
    let (status, body) = send(app, "POST", "/", Some(&auth), Some(json!({ "patient_id": patient_id }))).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["queue_number"], 4);
}
