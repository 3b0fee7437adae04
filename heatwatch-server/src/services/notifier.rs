use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::configs::Notification as NotificationConf;
use crate::errors::NotificationError;
use crate::services::shutdown::Shutdown;

#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    Text(String),
    Document { path: PathBuf, caption: String },
}

/// Escapes the characters Telegram's legacy Markdown treats as entity markers.
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Where queued notifications end up.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Telegram Bot API backend.
pub struct TelegramSink {
    client: reqwest::Client,
    api_base: String,
    token: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(
        api_base: &str,
        token: &str,
        chat_id: &str,
        timeout: Duration,
    ) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn send_message(&self, text: &str) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(self.endpoint("sendMessage"))
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "Markdown",
            }))
            .send()
            .await?;

        Self::check_status(response)
    }

    async fn send_document(&self, path: &Path, caption: &str) -> Result<(), NotificationError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "report".to_string());

        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", caption.to_string())
            .part("document", Part::bytes(bytes).file_name(file_name));

        let response = self
            .client
            .post(self.endpoint("sendDocument"))
            .multipart(form)
            .send()
            .await?;

        Self::check_status(response)
    }

    fn check_status(response: reqwest::Response) -> Result<(), NotificationError> {
        if !response.status().is_success() {
            return Err(NotificationError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError> {
        match notification {
            Notification::Text(text) => self.send_message(text).await,
            Notification::Document { path, caption } => self.send_document(path, caption).await,
        }
    }
}

/// Writes notifications to the log only, used when no bot is configured.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError> {
        match notification {
            Notification::Text(text) => tracing::info!("notification: {}", text),
            Notification::Document { path, caption } => {
                tracing::info!("notification document {}: {}", path.display(), caption)
            }
        }
        Ok(())
    }
}

/// Picks the Telegram backend when both token and chat id are set.
pub fn sink_from_settings(
    settings: &NotificationConf,
) -> Result<Arc<dyn NotificationSink>, NotificationError> {
    match (&settings.telegram_token, &settings.chat_id) {
        (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
            Ok(Arc::new(TelegramSink::new(
                &settings.api_base,
                token,
                chat_id,
                Duration::from_secs(settings.request_timeout_secs),
            )?))
        }
        _ => {
            tracing::warn!("telegram is not configured, notifications go to the log only");
            Ok(Arc::new(TracingSink))
        }
    }
}

/// Bounded queue in front of a single delivery worker.
#[derive(Clone)]
pub struct NotificationDispatcher {
    sender: mpsc::Sender<Notification>,
}

impl NotificationDispatcher {
    /// A dispatcher and the receiving end of its queue, without a worker.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    pub fn spawn(
        sink: Arc<dyn NotificationSink>,
        capacity: usize,
        shutdown: Shutdown,
    ) -> (Self, JoinHandle<()>) {
        let (dispatcher, receiver) = Self::channel(capacity);
        let handle = tokio::spawn(drain(receiver, sink, shutdown));
        (dispatcher, handle)
    }

    /// Queues a text message without waiting. Returns false when it was dropped.
    pub fn enqueue(&self, text: impl Into<String>) -> bool {
        self.push(Notification::Text(text.into()))
    }

    pub fn enqueue_document(&self, path: impl Into<PathBuf>, caption: impl Into<String>) -> bool {
        self.push(Notification::Document {
            path: path.into(),
            caption: caption.into(),
        })
    }

    fn push(&self, notification: Notification) -> bool {
        let result = self.sender.try_send(notification).map_err(|e| match e {
            TrySendError::Full(_) => NotificationError::QueueFull,
            TrySendError::Closed(_) => NotificationError::QueueClosed,
        });

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("dropping notification: {}", e);
                false
            }
        }
    }
}

async fn drain(
    mut receiver: mpsc::Receiver<Notification>,
    sink: Arc<dyn NotificationSink>,
    mut shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            next = receiver.recv() => match next {
                Some(notification) => deliver(sink.as_ref(), &notification).await,
                None => return,
            },
            _ = shutdown.wait() => break,
        }
    }

    // Deliver what was already accepted, then stop
    receiver.close();
    while let Some(notification) = receiver.recv().await {
        deliver(sink.as_ref(), &notification).await;
    }

    tracing::debug!("notification worker stopped");
}

async fn deliver(sink: &dyn NotificationSink, notification: &Notification) {
    if let Err(e) = sink.deliver(notification).await {
        tracing::error!("failed to deliver notification: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use crate::services::shutdown;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError> {
            self.delivered.lock().push(notification.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn deliver(&self, _: &Notification) -> Result<(), NotificationError> {
            Err(NotificationError::Rejected(502))
        }
    }

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("dryer_1"), "dryer\\_1");
        assert_eq!(escape_markdown("*[a]`"), "\\*\\[a]\\`");
        assert_eq!(escape_markdown("dev-1"), "dev-1");
    }

    #[test]
    fn test_full_queue_rejects_without_blocking() {
        let (dispatcher, _receiver) = NotificationDispatcher::channel(1);

        assert!(dispatcher.enqueue("first"));
        assert!(!dispatcher.enqueue("second"));
    }

    #[test]
    fn test_closed_queue_rejects() {
        let (dispatcher, receiver) = NotificationDispatcher::channel(4);
        drop(receiver);

        assert!(!dispatcher.enqueue("nobody listens"));
    }

    #[tokio::test]
    async fn test_worker_delivers_in_order_and_drains_on_shutdown() {
        let sink = Arc::new(RecordingSink::default());
        let (trigger, shutdown) = shutdown::channel();
        let (dispatcher, handle) = NotificationDispatcher::spawn(sink.clone(), 8, shutdown);

        assert!(dispatcher.enqueue("one"));
        assert!(dispatcher.enqueue_document("/tmp/report.csv", "daily"));
        assert!(dispatcher.enqueue("three"));

        trigger.trigger();
        handle.await.unwrap();

        let delivered = sink.delivered.lock().clone();
        assert_eq!(
            delivered,
            vec![
                Notification::Text("one".to_string()),
                Notification::Document {
                    path: PathBuf::from("/tmp/report.csv"),
                    caption: "daily".to_string(),
                },
                Notification::Text("three".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_stop_worker() {
        let (trigger, shutdown) = shutdown::channel();
        let (dispatcher, handle) = NotificationDispatcher::spawn(Arc::new(FailingSink), 4, shutdown);

        assert!(dispatcher.enqueue("lost"));
        assert!(dispatcher.enqueue("also lost"));

        trigger.trigger();
        handle.await.unwrap();
    }

    #[test]
    fn test_untokened_settings_fall_back_to_log() {
        let settings = NotificationConf {
            telegram_token: None,
            chat_id: Some("42".to_string()),
            api_base: "https://api.telegram.org".to_string(),
            queue_capacity: 4,
            request_timeout_secs: 10,
            commands_enabled: true,
            poll_timeout_secs: 30,
        };

        assert!(sink_from_settings(&settings).is_ok());
    }
}
