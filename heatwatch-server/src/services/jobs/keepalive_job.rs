use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::errors::JobError;
use crate::services::jobs::PeriodicJob;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Pings an external URL so hosting platforms keep the process awake.
pub struct KeepaliveJob {
    client: reqwest::Client,
    url: String,
    interval: Duration,
}

impl KeepaliveJob {
    pub fn new(url: impl Into<String>, interval: Duration) -> Result<Self, JobError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            url: url.into(),
            interval,
        })
    }
}

#[async_trait]
impl PeriodicJob for KeepaliveJob {
    fn name(&self) -> &'static str {
        "keepalive job"
    }

    fn next_delay(&self, _: OffsetDateTime) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<(), JobError> {
        let response = self.client.get(&self.url).send().await?;

        if response.status().is_success() {
            tracing::debug!("keepalive {} ok", self.url);
        } else {
            tracing::warn!("keepalive {} answered {}", self.url, response.status());
        }

        Ok(())
    }
}
