use super::{NotificationError, PersistenceError};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Notification failed: {0}")]
    Notification(#[from] NotificationError),

    #[error("Keepalive request failed: {0}")]
    Keepalive(#[from] reqwest::Error),

    #[error("Report encoding failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("Report file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Time calculation failed: {0}")]
    Time(String),
}
