use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

use crate::errors::ApiError;
use crate::models::{MeasurementKind, PivotTable};
use crate::repositories::Persistence;
use crate::services::TopicRouter;
use crate::services::jobs::{render_csv, report_file_name};

const DEFAULT_RECENT_LIMIT: i64 = 100;
const MAX_RECENT_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct ReadingState {
    pub router: Arc<TopicRouter>,
    pub persistence: Arc<dyn Persistence>,
    pub local_offset: UtcOffset,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct RecentQuery {
    limit: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct DailyQuery {
    /// Local date as YYYY-MM-DD, today when missing
    date: Option<String>,
    kind: Option<MeasurementKind>,
}

fn ensure_group(state: &ReadingState, group: &str) -> Result<(), ApiError> {
    if state.router.has_group(group) {
        Ok(())
    } else {
        Err(ApiError::GroupNotFound(group.to_string()))
    }
}

pub async fn get_recent_readings(
    Path(group): Path<String>,
    Query(query): Query<RecentQuery>,
    State(state): State<ReadingState>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_group(&state, &group)?;

    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    if !(1..=MAX_RECENT_LIMIT).contains(&limit) {
        return Err(ApiError::InvalidQuery(format!(
            "limit must be between 1 and {MAX_RECENT_LIMIT}"
        )));
    }

    let readings = state.persistence.query_recent(limit, &group).await?;

    Ok(Json(readings))
}

async fn daily_pivot(
    state: &ReadingState,
    group: &str,
    query: DailyQuery,
) -> Result<PivotTable, ApiError> {
    ensure_group(state, group)?;

    let date = match query.date {
        Some(date) => Date::parse(&date, format_description!("[year]-[month]-[day]"))
            .map_err(|_| ApiError::InvalidQuery(format!("invalid date {date}, expected YYYY-MM-DD")))?,
        None => OffsetDateTime::now_utc().to_offset(state.local_offset).date(),
    };
    let kind = query.kind.unwrap_or(MeasurementKind::Temperature);

    Ok(state.persistence.query_pivoted_by_date(date, group, kind).await?)
}

pub async fn get_daily_readings(
    Path(group): Path<String>,
    Query(query): Query<DailyQuery>,
    State(state): State<ReadingState>,
) -> Result<impl IntoResponse, ApiError> {
    let pivot = daily_pivot(&state, &group, query).await?;

    Ok(Json(pivot))
}

pub async fn download_daily_readings(
    Path(group): Path<String>,
    Query(query): Query<DailyQuery>,
    State(state): State<ReadingState>,
) -> Result<impl IntoResponse, ApiError> {
    let pivot = daily_pivot(&state, &group, query).await?;
    if pivot.rows.is_empty() {
        return Err(ApiError::NoData(group));
    }

    let date = pivot.rows[0].time.date();
    let disposition = format!(
        "attachment; filename=\"{}\"",
        report_file_name(&pivot.group, pivot.kind, date)
    );

    let body = render_csv(&pivot).map_err(|e| ApiError::InternalError(e.into()))?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    ))
}
