#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Notification queue is full")]
    QueueFull,

    #[error("Notification queue is closed")]
    QueueClosed,

    #[error("Notification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Notification backend rejected the request with status {0}")]
    Rejected(u16),

    #[error("Failed to read attachment: {0}")]
    Attachment(#[from] std::io::Error),
}
