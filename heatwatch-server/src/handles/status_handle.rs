use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};

use crate::errors::ApiError;
use crate::repositories::Persistence;
use crate::services::{AlertEngine, ConnectionStatus, NotificationDispatcher, StateStore, TopicRouter};

#[derive(Clone)]
pub struct StatusState {
    pub router: Arc<TopicRouter>,
    pub store: Arc<StateStore>,
    pub alerts: Arc<AlertEngine>,
    pub persistence: Arc<dyn Persistence>,
    pub connection: Arc<ConnectionStatus>,
    pub dispatcher: NotificationDispatcher,
}

pub async fn keepalive(State(state): State<StatusState>) -> Result<impl IntoResponse, ApiError> {
    let local = state.alerts.window().local_time(OffsetDateTime::now_utc());
    let timestamp = local
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .map_err(|e| ApiError::InternalError(e.into()))?;

    Ok(Json(json!({
        "status": "alive",
        "timestamp": timestamp,
    })))
}

pub async fn get_latest(State(state): State<StatusState>) -> impl IntoResponse {
    Json(state.store.snapshot_all())
}

pub async fn get_status(State(state): State<StatusState>) -> Result<impl IntoResponse, ApiError> {
    let since = OffsetDateTime::now_utc() - Duration::hours(24);

    let mut statistics = BTreeMap::new();
    for group in state.router.groups() {
        let group_statistics = state.persistence.query_statistics(since, group).await?;
        statistics.insert(group.to_string(), group_statistics);
    }

    let thresholds = state.alerts.thresholds();
    Ok(Json(json!({
        "connection": state.connection.snapshot(),
        "thresholds": {
            "min_temp": thresholds.min_temp,
            "max_temp": thresholds.max_temp,
        },
        "alerts": state.alerts.states(),
        "statistics": statistics,
    })))
}

pub async fn send_test_notification(State(state): State<StatusState>) -> impl IntoResponse {
    if state.dispatcher.enqueue("🔔 *Test notification*\n\nThe alert channel is working.") {
        (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "success", "message": "Test message queued" })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "message": "Notification queue is full" })),
        )
    }
}
