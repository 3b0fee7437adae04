pub mod api;
pub mod decode;
pub mod job;
pub mod notification;
pub mod persistence;
pub mod route;

pub use api::ApiError;
pub use decode::DecodeError;
pub use job::JobError;
pub use notification::NotificationError;
pub use persistence::PersistenceError;
pub use route::RouteError;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use uuid::Uuid;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message, error_id) = match self {
            ApiError::GroupNotFound(group) => {
                (StatusCode::NOT_FOUND, format!("Group {group} not found"), None)
            }
            ApiError::NoData(group) => (StatusCode::NOT_FOUND, format!("No data for {group}"), None),
            ApiError::InvalidQuery(reason) => {
                (StatusCode::BAD_REQUEST, format!("Invalid query: {reason}"), None)
            }
            ApiError::PersistenceError(e) => {
                let error_id = Uuid::new_v4();
                tracing::error!(error_id = ?error_id, "Persistence error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Some(error_id.to_string()),
                )
            }
            ApiError::InternalError(e) => {
                let error_id = Uuid::new_v4();
                tracing::error!(error_id = ?error_id, "Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Some(error_id.to_string()),
                )
            }
        };

        let mut error_obj = json!({
            "code": status.as_u16(),
            "message": error_message
        });

        // Only internal failures carry an id to correlate with the log line
        if let Some(error_id) = error_id {
            error_obj["error_id"] = json!(error_id);
        }

        (status, Json(json!({ "error": error_obj }))).into_response()
    }
}
