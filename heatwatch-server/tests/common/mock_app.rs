use std::sync::Arc;

use axum::Router;
use tokio::sync::mpsc;

use heatwatch_server::app::{AppContext, create_app};
use heatwatch_server::configs::{SchemaManager, Settings, Storage};
use heatwatch_server::repositories::DeviceRepository;
use heatwatch_server::services::shutdown::{self, ShutdownTrigger};
use heatwatch_server::services::{Notification, NotificationDispatcher};

pub const SETTINGS: &str = r#"
    [server]
    host = "127.0.0.1"
    port = 0

    [logger]
    level = "debug"

    [gateway]
    host = "localhost"
    port = 1883
    client_id = "heatwatch-test"
    keep_alive_secs = 30
    reconnect_initial_secs = 5
    reconnect_max_secs = 300

    [database]
    clean_start = true
    url = "sqlite::memory:"

    [alert]
    min_temp = 120.0
    max_temp = 155.0
    temperature_offset = 0.0
    utc_offset_hours = 7
    operating_start_hour = 6
    operating_end_hour = 17
    notify_all_clear = true
    reset_outside_window = true

    [notification]
    api_base = "http://127.0.0.1:9"
    queue_capacity = 16
    request_timeout_secs = 1

    [schedule]
    snapshot_interval_secs = 600
    consistency_interval_secs = 3600
    consistency_window_secs = 3600
    keepalive_interval_secs = 1800

    [[devices]]
    group = "grp-A"
    id = "dev-1"
    topic = "factory/grp-A/dev-1/temperature"

    [[devices]]
    group = "grp-A"
    id = "dev-2"
    topic = "factory/grp-A/dev-2/temperature"

    [[devices]]
    group = "grp-B"
    id = "hum-1"
    topic = "factory/grp-B/hum-1"
    kinds = ["humidity"]
    alerting = false
"#;

pub struct MockApp {
    pub context: AppContext,
    pub router: Router,
    pub notifications: mpsc::Receiver<Notification>,
    pub trigger: ShutdownTrigger,
}

impl MockApp {
    pub async fn new() -> Self {
        let settings = Arc::new(Settings::from_toml(SETTINGS).unwrap());

        let storage = Arc::new(
            Storage::new(settings.database.clone(), SchemaManager::default())
                .await
                .unwrap(),
        );
        DeviceRepository::new(storage.clone())
            .sync(&settings.devices)
            .await
            .unwrap();

        let (trigger, shutdown) = shutdown::channel();
        let (dispatcher, notifications) =
            NotificationDispatcher::channel(settings.notification.queue_capacity);

        let context = AppContext::new(settings, storage, dispatcher, shutdown).unwrap();
        let router = create_app(&context);

        Self {
            context,
            router,
            notifications,
            trigger,
        }
    }

    /// Every text notification queued so far.
    pub fn drain_texts(&mut self) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            if let Notification::Text(text) = notification {
                texts.push(text);
            }
        }
        texts
    }
}
