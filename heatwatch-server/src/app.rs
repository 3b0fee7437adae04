use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use time::UtcOffset;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::configs::{Settings, Storage};
use crate::handles::*;
use crate::repositories::{Persistence, ReadingRepository};
use crate::services::{
    AlertEngine, AlertMessage, ConnectionStatus, Coordinator, NotificationDispatcher, Shutdown,
    StateStore, TopicRouter,
};

/// Everything the ingestion path, jobs and handlers share.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub storage: Arc<Storage>,
    pub local_offset: UtcOffset,
    pub router: Arc<TopicRouter>,
    pub store: Arc<StateStore>,
    pub alerts: Arc<AlertEngine>,
    pub persistence: Arc<dyn Persistence>,
    pub dispatcher: NotificationDispatcher,
    pub events: broadcast::Sender<AlertMessage>,
    pub coordinator: Arc<Coordinator>,
    pub connection: Arc<ConnectionStatus>,
    pub shutdown: Shutdown,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        storage: Arc<Storage>,
        dispatcher: NotificationDispatcher,
        shutdown: Shutdown,
    ) -> anyhow::Result<Self> {
        let local_offset = settings.alert.utc_offset()?;
        let router = Arc::new(
            TopicRouter::new(&settings.devices).context("Invalid device configuration")?,
        );
        let store = Arc::new(StateStore::new(&router));
        let alerts = Arc::new(AlertEngine::from_settings(&settings.alert, &router)?);
        let persistence: Arc<dyn Persistence> =
            Arc::new(ReadingRepository::new(storage.clone(), local_offset));
        let (events, _) = broadcast::channel(100);

        let coordinator = Arc::new(Coordinator::new(
            router.clone(),
            store.clone(),
            alerts.clone(),
            dispatcher.clone(),
            events.clone(),
            settings.alert.temperature_offset,
        ));

        Ok(Self {
            settings,
            storage,
            local_offset,
            router,
            store,
            alerts,
            persistence,
            dispatcher,
            events,
            coordinator,
            connection: Arc::new(ConnectionStatus::default()),
            shutdown,
        })
    }
}

pub fn create_app(context: &AppContext) -> Router {
    let status = Router::new()
        .route("/keepalive", get(keepalive))
        .route("/api/latest", get(get_latest))
        .route("/api/status", get(get_status))
        .route("/api/notifications/test", post(send_test_notification))
        .with_state(StatusState {
            router: context.router.clone(),
            store: context.store.clone(),
            alerts: context.alerts.clone(),
            persistence: context.persistence.clone(),
            connection: context.connection.clone(),
            dispatcher: context.dispatcher.clone(),
        });

    let readings = Router::new()
        .route("/:group/recent", get(get_recent_readings))
        .route("/:group/daily", get(get_daily_readings))
        .route("/:group/daily.csv", get(download_daily_readings))
        .with_state(ReadingState {
            router: context.router.clone(),
            persistence: context.persistence.clone(),
            local_offset: context.local_offset,
        });

    let streams = Router::new()
        .route("/api/stream", get(stream_latest))
        .route("/api/events", get(stream_alerts))
        .with_state(StreamState {
            store: context.store.clone(),
            sender: context.events.clone(),
            shutdown: context.shutdown.clone(),
        });

    Router::new()
        .merge(status)
        .merge(streams)
        .nest("/api/readings", readings)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
