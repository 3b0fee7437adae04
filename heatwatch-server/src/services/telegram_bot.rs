use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::configs::Notification as NotificationConf;
use crate::errors::{JobError, NotificationError};
use crate::repositories::Persistence;
use crate::services::jobs::DailyReportJob;
use crate::services::notifier::{NotificationDispatcher, escape_markdown};
use crate::services::router::TopicRouter;
use crate::services::shutdown::Shutdown;

const REPLY_TIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

const RECENT_READINGS: i64 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// A press on one of the menu buttons.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub data: Option<String>,
    pub message: Option<Message>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BotCommand {
    Menu,
    Test,
    Data(String),
    Report,
}

impl BotCommand {
    /// Reads a typed command such as `Mulai`, `/data@heatwatch_bot dryer` or `report`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut words = text.split_whitespace();
        let head = words.next()?.trim_start_matches('/');
        let head = head.split('@').next().unwrap_or(head).to_lowercase();

        match head.as_str() {
            "mulai" | "start" | "menu" | "help" => Some(Self::Menu),
            "test" => Some(Self::Test),
            "data" => Some(
                words
                    .next()
                    .map(|group| Self::Data(group.to_string()))
                    .unwrap_or(Self::Menu),
            ),
            "report" => Some(Self::Report),
            _ => None,
        }
    }

    /// Reads the callback data of a menu button.
    pub fn from_callback(data: &str) -> Option<Self> {
        match data.split_once(':') {
            Some(("data", group)) if !group.is_empty() => Some(Self::Data(group.to_string())),
            Some(_) => None,
            None => match data {
                "test" => Some(Self::Test),
                "report" => Some(Self::Report),
                _ => None,
            },
        }
    }
}

/// A command that came from the authorised chat.
#[derive(Debug, PartialEq)]
pub struct Incoming {
    pub command: BotCommand,
    /// Set when the command came from a button, which must be acknowledged
    pub callback_id: Option<String>,
}

/// Pulls the command out of an update. Other chats and unknown text give `None`.
pub fn extract_command(update: &Update, chat_id: &str) -> Option<Incoming> {
    let authorised = |message: &Message| message.chat.id.to_string() == chat_id;

    if let Some(query) = &update.callback_query {
        if !query.message.as_ref().is_some_and(authorised) {
            tracing::warn!("ignoring button press from another chat");
            return None;
        }
        return Some(Incoming {
            command: BotCommand::from_callback(query.data.as_deref()?)?,
            callback_id: Some(query.id.clone()),
        });
    }

    let message = update.message.as_ref()?;
    if !authorised(message) {
        tracing::warn!("ignoring message from chat {}", message.chat.id);
        return None;
    }

    Some(Incoming {
        command: BotCommand::parse(message.text.as_deref()?)?,
        callback_id: None,
    })
}

/// What the bot does for each command.
pub struct BotCommands {
    router: Arc<TopicRouter>,
    persistence: Arc<dyn Persistence>,
    reports: DailyReportJob,
    offset: UtcOffset,
}

impl BotCommands {
    pub fn new(
        router: Arc<TopicRouter>,
        persistence: Arc<dyn Persistence>,
        dispatcher: NotificationDispatcher,
        report_dir: impl Into<PathBuf>,
        offset: UtcOffset,
    ) -> Self {
        let reports = DailyReportJob::new(
            router.clone(),
            persistence.clone(),
            dispatcher,
            report_dir,
            offset,
        );

        Self {
            router,
            persistence,
            reports,
            offset,
        }
    }

    /// Menu buttons as (label, callback data).
    pub fn menu(&self) -> Vec<(String, String)> {
        let mut buttons = vec![("Test Message".to_string(), "test".to_string())];
        for group in self.router.groups() {
            buttons.push((format!("Data {group}"), format!("data:{group}")));
        }
        buttons.push(("Today's Report".to_string(), "report".to_string()));
        buttons
    }

    pub async fn execute(&self, command: &BotCommand) -> Result<String, JobError> {
        self.execute_at(command, OffsetDateTime::now_utc()).await
    }

    /// Runs `command` as if it arrived at `now` and returns the reply text.
    pub async fn execute_at(
        &self,
        command: &BotCommand,
        now: OffsetDateTime,
    ) -> Result<String, JobError> {
        let local = now.to_offset(self.offset);

        match command {
            BotCommand::Menu => Ok("Choose an option:".to_string()),
            BotCommand::Test => Ok(format!(
                "🧪 *Test message*\n🕒 Time: {}\n✅ The bot is working.",
                Self::format_time(local)?
            )),
            BotCommand::Data(group) => self.recent_data(group).await,
            BotCommand::Report => {
                let date = local.date();
                let written = self.reports.report(date).await?;
                if written.is_empty() {
                    Ok(format!("❌ No data recorded on {date}"))
                } else {
                    Ok(format!("✅ {} report file(s) for {} queued", written.len(), date))
                }
            }
        }
    }

    async fn recent_data(&self, group: &str) -> Result<String, JobError> {
        if !self.router.has_group(group) {
            return Ok(format!(
                "❌ Unknown group {}. Available: {}",
                escape_markdown(group),
                escape_markdown(&self.router.groups().join(", "))
            ));
        }

        let readings = self.persistence.query_recent(RECENT_READINGS, group).await?;
        if readings.is_empty() {
            return Ok(format!("❌ No data available for {}", escape_markdown(group)));
        }

        let mut text = format!(
            "📊 *Last {} readings for {}*\n\n",
            readings.len(),
            escape_markdown(&group.to_uppercase())
        );
        for reading in readings {
            text.push_str(&format!(
                "*{}* {}\n🕐 {}\n🌡️ {:.1}{}\n\n",
                escape_markdown(&reading.device_id.to_uppercase()),
                reading.kind,
                Self::format_time(reading.time.to_offset(self.offset))?,
                reading.value,
                reading.kind.unit()
            ));
        }

        Ok(text)
    }

    fn format_time(time: OffsetDateTime) -> Result<String, JobError> {
        time.format(REPLY_TIME_FORMAT)
            .map_err(|e| JobError::Time(e.to_string()))
    }
}

/// Long-polls getUpdates and answers chat commands.
pub struct TelegramBot {
    client: reqwest::Client,
    api_base: String,
    token: String,
    chat_id: String,
    poll_timeout: Duration,
    next_update: i64,
    commands: BotCommands,
    dispatcher: NotificationDispatcher,
}

impl TelegramBot {
    pub fn new(
        settings: &NotificationConf,
        token: &str,
        chat_id: &str,
        commands: BotCommands,
        dispatcher: NotificationDispatcher,
    ) -> Result<Self, NotificationError> {
        let poll_timeout = Duration::from_secs(settings.poll_timeout_secs);
        // the long poll itself must not trip the client timeout
        let client = reqwest::Client::builder()
            .timeout(poll_timeout + Duration::from_secs(settings.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
            poll_timeout,
            next_update: 0,
            commands,
            dispatcher,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    pub async fn run(mut self, mut shutdown: Shutdown) {
        tracing::info!("telegram command polling started");

        loop {
            let updates = tokio::select! {
                updates = self.get_updates() => updates,
                _ = shutdown.wait() => break,
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        self.next_update = self.next_update.max(update.update_id + 1);
                        if let Some(incoming) = extract_command(&update, &self.chat_id) {
                            self.respond(incoming).await;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("telegram getUpdates failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                        _ = shutdown.wait() => break,
                    }
                }
            }
        }

        tracing::info!("telegram command polling stopped");
    }

    async fn get_updates(&self) -> Result<Vec<Update>, NotificationError> {
        let response = self
            .client
            .get(self.endpoint("getUpdates"))
            .query(&[
                ("offset", self.next_update.to_string()),
                ("timeout", self.poll_timeout.as_secs().to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Rejected(status.as_u16()));
        }

        let body: UpdatesResponse = response.json().await?;
        if !body.ok {
            tracing::warn!(
                "getUpdates not ok: {}",
                body.description.unwrap_or_default()
            );
            return Err(NotificationError::Rejected(status.as_u16()));
        }

        Ok(body.result)
    }

    async fn respond(&self, incoming: Incoming) {
        tracing::info!("telegram command {:?}", incoming.command);

        if let Some(callback_id) = &incoming.callback_id {
            if let Err(e) = self.answer_callback(callback_id).await {
                tracing::warn!("failed to acknowledge button press: {}", e);
            }
        }

        match self.commands.execute(&incoming.command).await {
            Ok(reply) if incoming.command == BotCommand::Menu => {
                if let Err(e) = self.send_menu(&reply).await {
                    tracing::error!("failed to send menu: {}", e);
                }
            }
            Ok(reply) => {
                self.dispatcher.enqueue(reply);
            }
            Err(e) => {
                tracing::error!("command {:?} failed: {}", incoming.command, e);
                self.dispatcher.enqueue("⚠️ Command failed, see the server log.");
            }
        }
    }

    async fn send_menu(&self, text: &str) -> Result<(), NotificationError> {
        let keyboard: Vec<_> = self
            .commands
            .menu()
            .into_iter()
            .map(|(label, data)| json!([{ "text": label, "callback_data": data }]))
            .collect();

        let response = self
            .client
            .post(self.endpoint("sendMessage"))
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "reply_markup": { "inline_keyboard": keyboard },
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotificationError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(self.endpoint("answerCallbackQuery"))
            .json(&json!({ "callback_query_id": callback_id }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotificationError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use time::macros::{datetime, offset};

    use crate::configs::{Database, DeviceConf, SchemaManager, Storage};
    use crate::models::{DeviceIdentity, MeasurementKind};
    use crate::repositories::{DeviceRepository, ReadingRepository};
    use crate::services::notifier::Notification;

    use super::*;

    fn update(json: &str) -> Update {
        serde_json::from_str(json).unwrap()
    }

    fn devices() -> Vec<DeviceConf> {
        vec![
            DeviceConf {
                group: "dryer".to_string(),
                id: "dryer_1".to_string(),
                topic: "esp32/dryer1/temp".to_string(),
                kinds: vec![MeasurementKind::Temperature],
                alerting: true,
            },
            DeviceConf {
                group: "boiler".to_string(),
                id: "boiler1".to_string(),
                topic: "esp32/boiler1/temp".to_string(),
                kinds: vec![MeasurementKind::Temperature],
                alerting: true,
            },
        ]
    }

    async fn commands(
        report_dir: &std::path::Path,
    ) -> (BotCommands, Arc<ReadingRepository>, tokio::sync::mpsc::Receiver<Notification>) {
        let storage = Arc::new(
            Storage::new(
                Database {
                    migration_path: None,
                    clean_start: true,
                    url: String::from("sqlite::memory:"),
                },
                SchemaManager::default(),
            )
            .await
            .unwrap(),
        );
        DeviceRepository::new(storage.clone()).sync(&devices()).await.unwrap();

        let repository = Arc::new(ReadingRepository::new(storage, offset!(+7)));
        let (dispatcher, queue) = NotificationDispatcher::channel(8);
        let commands = BotCommands::new(
            Arc::new(TopicRouter::new(&devices()).unwrap()),
            repository.clone(),
            dispatcher,
            report_dir,
            offset!(+7),
        );

        (commands, repository, queue)
    }

    #[test]
    fn test_parse_typed_commands() {
        assert_eq!(BotCommand::parse("Mulai"), Some(BotCommand::Menu));
        assert_eq!(BotCommand::parse("/start"), Some(BotCommand::Menu));
        assert_eq!(BotCommand::parse(" test "), Some(BotCommand::Test));
        assert_eq!(
            BotCommand::parse("/data@heatwatch_bot dryer"),
            Some(BotCommand::Data("dryer".to_string()))
        );
        assert_eq!(BotCommand::parse("data"), Some(BotCommand::Menu));
        assert_eq!(BotCommand::parse("REPORT"), Some(BotCommand::Report));
        assert_eq!(BotCommand::parse("hello there"), None);
        assert_eq!(BotCommand::parse("   "), None);
    }

    #[test]
    fn test_parse_button_callbacks() {
        assert_eq!(BotCommand::from_callback("test"), Some(BotCommand::Test));
        assert_eq!(
            BotCommand::from_callback("data:kedi"),
            Some(BotCommand::Data("kedi".to_string()))
        );
        assert_eq!(BotCommand::from_callback("data:"), None);
        assert_eq!(BotCommand::from_callback("report"), Some(BotCommand::Report));
        assert_eq!(BotCommand::from_callback("force_excel"), None);
    }

    #[test]
    fn test_extract_command_only_from_configured_chat() {
        let typed = update(
            r#"{"update_id": 10, "message": {"chat": {"id": -100123}, "text": "data dryer"}}"#,
        );
        assert_eq!(
            extract_command(&typed, "-100123"),
            Some(Incoming {
                command: BotCommand::Data("dryer".to_string()),
                callback_id: None,
            })
        );
        assert_eq!(extract_command(&typed, "42"), None);

        let pressed = update(
            r#"{"update_id": 11, "callback_query": {"id": "cb-1", "data": "report",
                "message": {"chat": {"id": -100123}, "text": "Choose an option:"}}}"#,
        );
        assert_eq!(
            extract_command(&pressed, "-100123"),
            Some(Incoming {
                command: BotCommand::Report,
                callback_id: Some("cb-1".to_string()),
            })
        );

        let sticker = update(r#"{"update_id": 12, "message": {"chat": {"id": -100123}}}"#);
        assert_eq!(extract_command(&sticker, "-100123"), None);
    }

    #[tokio::test]
    async fn test_menu_lists_every_group() {
        let dir = tempfile::tempdir().unwrap();
        let (commands, _, _queue) = commands(dir.path()).await;

        let callbacks: Vec<String> = commands.menu().into_iter().map(|(_, data)| data).collect();
        assert_eq!(callbacks, vec!["test", "data:dryer", "data:boiler", "report"]);
    }

    #[tokio::test]
    async fn test_data_command_lists_latest_five() {
        let dir = tempfile::tempdir().unwrap();
        let (commands, repository, _queue) = commands(dir.path()).await;
        let dryer = DeviceIdentity::new("dryer", "dryer_1");

        for minute in 0..7i64 {
            repository
                .insert_reading(
                    datetime!(2024-03-01 02:00:00 UTC) + time::Duration::minutes(minute),
                    &dryer,
                    MeasurementKind::Temperature,
                    130.0 + minute as f64,
                )
                .await
                .unwrap();
        }

        let reply = commands
            .execute(&BotCommand::Data("dryer".to_string()))
            .await
            .unwrap();

        assert!(reply.contains("Last 5 readings for DRYER"));
        assert_eq!(reply.matches("DRYER\\_1").count(), 5);
        assert!(reply.contains("136.0°C"));
        assert!(reply.contains("2024-03-01 09:06:00"));
        assert!(!reply.contains("131.0°C"));
    }

    #[tokio::test]
    async fn test_data_command_for_unknown_or_empty_group() {
        let dir = tempfile::tempdir().unwrap();
        let (commands, _, _queue) = commands(dir.path()).await;

        let reply = commands
            .execute(&BotCommand::Data("kiln".to_string()))
            .await
            .unwrap();
        assert!(reply.contains("Unknown group kiln"));
        assert!(reply.contains("dryer, boiler"));

        let reply = commands
            .execute(&BotCommand::Data("boiler".to_string()))
            .await
            .unwrap();
        assert!(reply.contains("No data available for boiler"));
    }

    #[tokio::test]
    async fn test_report_command_sends_todays_files() {
        let dir = tempfile::tempdir().unwrap();
        let (commands, repository, mut queue) = commands(dir.path()).await;
        // 10:00 local
        let now = datetime!(2024-03-01 03:00:00 UTC);

        let reply = commands.execute_at(&BotCommand::Report, now).await.unwrap();
        assert!(reply.contains("No data recorded on 2024-03-01"));
        assert!(queue.try_recv().is_err());

        repository
            .insert_reading(
                datetime!(2024-03-01 02:00:00 UTC),
                &DeviceIdentity::new("dryer", "dryer_1"),
                MeasurementKind::Temperature,
                133.0,
            )
            .await
            .unwrap();

        let reply = commands.execute_at(&BotCommand::Report, now).await.unwrap();
        assert!(reply.contains("1 report file(s) for 2024-03-01"));

        let Ok(Notification::Document { path, .. }) = queue.try_recv() else {
            panic!("expected the report to be queued");
        };
        assert!(path.ends_with("dryer_temperature_2024-03-01.csv"));
    }

    #[tokio::test]
    async fn test_test_command_reports_local_time() {
        let dir = tempfile::tempdir().unwrap();
        let (commands, _, _queue) = commands(dir.path()).await;

        let reply = commands
            .execute_at(&BotCommand::Test, datetime!(2024-03-01 03:00:00 UTC))
            .await
            .unwrap();

        assert!(reply.contains("2024-03-01 10:00:00"));
    }
}
