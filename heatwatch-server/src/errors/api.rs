use super::PersistenceError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Group {0} not found")]
    GroupNotFound(String),

    #[error("No data for {0}")]
    NoData(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Persistence error: {0}")]
    PersistenceError(#[from] PersistenceError),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}
