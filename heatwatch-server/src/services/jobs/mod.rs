use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use crate::errors::JobError;
use crate::services::shutdown::Shutdown;

mod consistency_job;
mod keepalive_job;
mod report_job;
mod snapshot_job;

pub use consistency_job::{ConsistencyJob, StuckSensor, stuck_value};
pub use keepalive_job::KeepaliveJob;
pub use report_job::{DailyReportJob, delay_until_next_run, render_csv, report_file_name};
pub use snapshot_job::SnapshotJob;

/// Work repeated on a timer, independent of ingestion.
#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// How long to sleep before the next run.
    fn next_delay(&self, now: OffsetDateTime) -> Duration;

    async fn run_once(&self) -> Result<(), JobError>;
}

/// Runs `job` until shutdown. A failed iteration is logged and the job waits for its next turn.
pub fn spawn_job<J: PeriodicJob>(job: J, mut shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("{} scheduled", job.name());

        loop {
            let delay = job.next_delay(OffsetDateTime::now_utc());

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait() => break,
            }

            if let Err(e) = job.run_once().await {
                tracing::error!("{} failed: {}", job.name(), e);
            }
        }

        tracing::debug!("{} stopped", job.name());
    })
}
