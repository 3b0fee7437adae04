pub mod alert_engine;
pub mod coordinator;
pub mod decoder;
pub mod jobs;
pub mod mqtt_service;
pub mod notifier;
pub mod router;
pub mod shutdown;
pub mod state_store;
pub mod telegram_bot;

pub use alert_engine::{
    AlertEngine, AlertMessage, AlertPolicy, AlertState, AlertThresholds, Evaluation,
    OperatingWindow,
};
pub use coordinator::{Coordinator, IngestOutcome};
pub use decoder::{DecodedPayload, Reading, StructuredPayload, decode};
pub use mqtt_service::{Backoff, ConnectionSnapshot, ConnectionStatus, MqttService};
pub use notifier::{
    Notification, NotificationDispatcher, NotificationSink, TelegramSink, TracingSink,
    escape_markdown, sink_from_settings,
};
pub use router::{DeviceRoute, TopicRouter};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use state_store::{LatestSnapshot, StateStore};
pub use telegram_bot::{BotCommand, BotCommands, TelegramBot};
