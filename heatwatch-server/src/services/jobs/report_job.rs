use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use csv::Writer;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

use crate::errors::JobError;
use crate::models::{MeasurementKind, PivotTable};
use crate::repositories::Persistence;
use crate::services::jobs::PeriodicJob;
use crate::services::notifier::NotificationDispatcher;
use crate::services::router::TopicRouter;

const ROW_TIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Seconds after local midnight at which the previous day is reported.
const RUN_AFTER_MIDNIGHT: time::Duration = time::Duration::seconds(5);

/// Time left until the next local midnight plus a few seconds.
pub fn delay_until_next_run(now: OffsetDateTime, offset: UtcOffset) -> Duration {
    let local = now.to_offset(offset);
    let mut next = local.date().midnight().assume_offset(offset) + RUN_AFTER_MIDNIGHT;
    if next <= local {
        next += time::Duration::days(1);
    }

    (next - now).unsigned_abs()
}

/// One header row of device ids, then one row per snapshot time. Missing values stay empty.
pub fn render_csv(pivot: &PivotTable) -> Result<String, JobError> {
    let mut writer = Writer::from_writer(Vec::new());

    writer.write_record(std::iter::once("time").chain(pivot.devices.iter().map(String::as_str)))?;

    for row in &pivot.rows {
        let time = row
            .time
            .format(ROW_TIME_FORMAT)
            .map_err(|e| JobError::Time(e.to_string()))?;

        let mut record = Vec::with_capacity(row.values.len() + 1);
        record.push(time);
        record.extend(
            row.values
                .iter()
                .map(|value| value.map(|v| format!("{v:.2}")).unwrap_or_default()),
        );
        writer.write_record(&record)?;
    }

    let bytes = writer.into_inner().map_err(|e| JobError::Io(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| JobError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// `{group}_{kind}_{date}.csv` with anything outside `[A-Za-z0-9_-]` in the group replaced.
pub fn report_file_name(group: &str, kind: MeasurementKind, date: Date) -> String {
    let group: String = group
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();

    format!("{group}_{kind}_{date}.csv")
}

/// Writes yesterday's readings per group and kind as CSV and sends the files out.
pub struct DailyReportJob {
    router: Arc<TopicRouter>,
    persistence: Arc<dyn Persistence>,
    dispatcher: NotificationDispatcher,
    report_dir: PathBuf,
    offset: UtcOffset,
}

impl DailyReportJob {
    pub fn new(
        router: Arc<TopicRouter>,
        persistence: Arc<dyn Persistence>,
        dispatcher: NotificationDispatcher,
        report_dir: impl Into<PathBuf>,
        offset: UtcOffset,
    ) -> Self {
        Self {
            router,
            persistence,
            dispatcher,
            report_dir: report_dir.into(),
            offset,
        }
    }

    /// Produces the reports of `date`. Groups without rows are skipped.
    pub async fn report(&self, date: Date) -> Result<Vec<PathBuf>, JobError> {
        tokio::fs::create_dir_all(&self.report_dir).await?;

        let mut written = Vec::new();
        for group in self.router.groups() {
            let kinds: BTreeSet<MeasurementKind> = self
                .router
                .routes_in(group)
                .flat_map(|route| route.kinds.iter().copied())
                .collect();

            for kind in kinds {
                let pivot = self
                    .persistence
                    .query_pivoted_by_date(date, group, kind)
                    .await?;
                if pivot.rows.is_empty() {
                    tracing::info!("no {} data for {} on {}", kind, group, date);
                    continue;
                }

                let path = self.report_dir.join(report_file_name(group, kind, date));
                tokio::fs::write(&path, render_csv(&pivot)?).await?;

                self.dispatcher.enqueue_document(
                    &path,
                    format!("📊 Daily {} report for {} ({})", kind, group, date),
                );
                tracing::info!("daily report written to {}", path.display());
                written.push(path);
            }
        }

        Ok(written)
    }
}

#[async_trait]
impl PeriodicJob for DailyReportJob {
    fn name(&self) -> &'static str {
        "daily report job"
    }

    fn next_delay(&self, now: OffsetDateTime) -> Duration {
        delay_until_next_run(now, self.offset)
    }

    async fn run_once(&self) -> Result<(), JobError> {
        let today = OffsetDateTime::now_utc().to_offset(self.offset).date();
        let yesterday = today
            .previous_day()
            .ok_or_else(|| JobError::Time(format!("no day before {today}")))?;

        self.report(yesterday).await.map(|_| ())
    }
}
