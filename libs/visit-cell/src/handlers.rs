use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use axum_extra::TypedHeader;
use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use headers::{authorization::Bearer, Authorization};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;
use shared_models::error::AppError;

use crate::models::{
    CreateVisitRequest, QueueInvalidation, QueueParams, StationGroup, UpdateVisitStatusRequest,
    VisitListParams, VisitQuery, VisitView,
};
use crate::services::{QueueSubscription, QueueSyncService, VisitService};

/// Everything the visit routes need, built once at startup.
pub struct VisitState {
    pub config: Arc<AppConfig>,
    pub visits: VisitService,
    pub sync: QueueSyncService,
}

impl VisitState {
    pub fn new(config: Arc<AppConfig>, visits: VisitService, sync: QueueSyncService) -> Self {
        Self { config, visits, sync }
    }
}

#[axum::debug_handler]
pub async fn list_visits(
    State(state): State<Arc<VisitState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Query(params): Query<VisitListParams>,
) -> Result<Json<Value>, AppError> {
    let query = VisitQuery::try_from(params)?;
    let today = state.visits.calendar().today();

    let visits = state.visits.list_visits(&query, Some(auth.token())).await?;
    let views: Vec<VisitView> = visits.into_iter().map(|v| VisitView::new(v, today)).collect();

    Ok(Json(json!({
        "visits": views,
        "total": views.len()
    })))
}

#[axum::debug_handler]
pub async fn today_queue(
    State(state): State<Arc<VisitState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Query(params): Query<QueueParams>,
) -> Result<Json<Value>, AppError> {
    let station = params
        .station
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<StationGroup>)
        .transpose()?;

    let board = state.visits.today_queue(station, Some(auth.token())).await?;
    Ok(Json(json!(board)))
}

#[axum::debug_handler]
pub async fn create_visit(
    State(state): State<Arc<VisitState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateVisitRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    info!("User {} is queueing patient {}", user.id, request.patient_id);

    let visit = state.visits.create_visit(request.patient_id, Some(auth.token())).await?;
    let view = VisitView::new(visit, state.visits.calendar().today());

    Ok((StatusCode::CREATED, Json(json!(view))))
}

#[axum::debug_handler]
pub async fn get_visit(
    State(state): State<Arc<VisitState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(visit_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let visit = state.visits.get_visit(visit_id, Some(auth.token())).await?;
    Ok(Json(json!(VisitView::new(visit, state.visits.calendar().today()))))
}

#[axum::debug_handler]
pub async fn advance_visit(
    State(state): State<Arc<VisitState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(visit_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    debug!("User {} advancing visit {}", user.id, visit_id);

    let visit = state.visits.advance_visit(visit_id, Some(auth.token())).await?;
    Ok(Json(json!(VisitView::new(visit, state.visits.calendar().today()))))
}

#[axum::debug_handler]
pub async fn update_visit_status(
    State(state): State<Arc<VisitState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(visit_id): Path<Uuid>,
    Json(request): Json<UpdateVisitStatusRequest>,
) -> Result<Json<Value>, AppError> {
    debug!("User {} setting visit {} to {}", user.id, visit_id, request.status);

    let visit = state
        .visits
        .update_visit_status(visit_id, request.status, Some(auth.token()))
        .await?;
    Ok(Json(json!(VisitView::new(visit, state.visits.calendar().today()))))
}

/// Upgrades to a websocket that tells the client when to refetch the queue.
/// The channel is opened before the upgrade so failures surface as HTTP errors.
pub async fn live_queue(
    ws: WebSocketUpgrade,
    State(state): State<Arc<VisitState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<impl IntoResponse, AppError> {
    let subscription = state.sync.activate(Some(auth.token().to_string())).await?;
    info!("Live queue opened for user {}", user.id);

    Ok(ws.on_upgrade(move |socket| stream_queue(socket, subscription)))
}

async fn stream_queue(socket: WebSocket, subscription: QueueSubscription) {
    let (mut sink, mut stream) = socket.split();
    let mut updates = subscription.updates();

    let hello = json!({
        "type": "subscribed",
        "date": subscription.activation_date(),
    });
    if sink.send(Message::Text(hello.to_string().into())).await.is_err() {
        close_subscription(&subscription).await;
        return;
    }

    loop {
        tokio::select! {
            notice = updates.recv() => {
                let Some(message) = queue_message(notice, subscription.activation_date()) else {
                    break;
                };
                if sink.send(Message::Text(message.to_string().into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!("Live queue socket failed: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    close_subscription(&subscription).await;
}

/// Frame sent for one received notice. A lagged consumer still learns which
/// day to refetch; `None` means the subscription has ended.
fn queue_message(notice: Result<QueueInvalidation, RecvError>, date: NaiveDate) -> Option<Value> {
    match notice {
        Ok(notice) => Some(json!({ "type": "invalidated", "date": notice.date, "notice": notice })),
        Err(RecvError::Lagged(skipped)) => {
            debug!("Live queue consumer lagged by {} notices", skipped);
            Some(json!({ "type": "invalidated", "date": date, "skipped": skipped, "notice": null }))
        }
        Err(RecvError::Closed) => None,
    }
}

async fn close_subscription(subscription: &QueueSubscription) {
    if let Err(e) = subscription.close().await {
        warn!("Failed to close live queue subscription: {}", e);
    }
}
