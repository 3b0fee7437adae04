use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::errors::JobError;
use crate::repositories::Persistence;
use crate::services::jobs::PeriodicJob;
use crate::services::router::TopicRouter;
use crate::services::state_store::StateStore;

/// Persists the latest non-null value of every device on each tick.
pub struct SnapshotJob {
    router: Arc<TopicRouter>,
    store: Arc<StateStore>,
    persistence: Arc<dyn Persistence>,
    interval: Duration,
}

impl SnapshotJob {
    pub fn new(
        router: Arc<TopicRouter>,
        store: Arc<StateStore>,
        persistence: Arc<dyn Persistence>,
        interval: Duration,
    ) -> Self {
        Self {
            router,
            store,
            persistence,
            interval,
        }
    }

    /// Writes one row per present value. Returns the number of rows written.
    pub async fn snapshot(&self, at: OffsetDateTime) -> Result<u64, JobError> {
        let mut written = 0;
        let mut failure = None;

        for group in self.router.groups() {
            let values = self.store.present_values(group);
            if values.is_empty() {
                tracing::debug!("no data for {} yet, skipping snapshot", group);
                continue;
            }

            match self.persistence.insert_readings(at, &values).await {
                Ok(count) => written += count,
                Err(e) => {
                    tracing::error!("failed to save {} snapshot: {}", group, e);
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e.into()),
            None => {
                tracing::info!("saved {} reading(s)", written);
                Ok(written)
            }
        }
    }
}

#[async_trait]
impl PeriodicJob for SnapshotJob {
    fn name(&self) -> &'static str {
        "snapshot job"
    }

    fn next_delay(&self, _: OffsetDateTime) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<(), JobError> {
        self.snapshot(OffsetDateTime::now_utc()).await.map(|_| ())
    }
}
