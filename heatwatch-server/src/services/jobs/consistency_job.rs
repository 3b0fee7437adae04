use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::errors::JobError;
use crate::models::{DeviceIdentity, MeasurementKind};
use crate::repositories::Persistence;
use crate::services::jobs::PeriodicJob;
use crate::services::notifier::{NotificationDispatcher, escape_markdown};
use crate::services::router::TopicRouter;

#[derive(Clone, Debug, PartialEq)]
pub struct StuckSensor {
    pub identity: DeviceIdentity,
    pub value: f64,
}

/// The single value every reading collapses to at two decimals, if any.
pub fn stuck_value(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }

    let first = (values[0] * 100.0).round();
    values
        .iter()
        .all(|value| (value * 100.0).round() == first)
        .then_some(first / 100.0)
}

/// Flags temperature sensors whose stored readings stopped changing.
///
/// A sensor is reported once per episode and re-armed when its readings vary again.
pub struct ConsistencyJob {
    router: Arc<TopicRouter>,
    persistence: Arc<dyn Persistence>,
    dispatcher: NotificationDispatcher,
    window: Duration,
    interval: Duration,
    flagged: Mutex<HashSet<DeviceIdentity>>,
}

impl ConsistencyJob {
    pub fn new(
        router: Arc<TopicRouter>,
        persistence: Arc<dyn Persistence>,
        dispatcher: NotificationDispatcher,
        window: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            router,
            persistence,
            dispatcher,
            window,
            interval,
            flagged: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the sensors newly found stuck at `now`.
    pub async fn check(&self, now: OffsetDateTime) -> Result<Vec<StuckSensor>, JobError> {
        let since = now - self.window;
        let mut newly_stuck = Vec::new();

        for group in self.router.groups() {
            let readings = self.persistence.query_since(since, group).await?;

            let mut by_device: BTreeMap<String, Vec<f64>> = BTreeMap::new();
            for reading in readings
                .into_iter()
                .filter(|r| r.kind == MeasurementKind::Temperature)
            {
                by_device.entry(reading.device_id).or_default().push(reading.value);
            }

            for (device_id, values) in by_device {
                let identity = DeviceIdentity::new(group, device_id);
                let stuck = stuck_value(&values);
                let mut flagged = self.flagged.lock();

                match stuck {
                    Some(value) if flagged.insert(identity.clone()) => {
                        tracing::warn!("{} temperature stuck at {:.2}", identity, value);
                        newly_stuck.push(StuckSensor { identity, value });
                    }
                    Some(_) => {}
                    None => {
                        if flagged.remove(&identity) {
                            tracing::info!("{} readings are changing again", identity);
                        }
                    }
                }
            }
        }

        let minutes = self.window.as_secs() / 60;
        for sensor in &newly_stuck {
            self.dispatcher.enqueue(format!(
                "⚠️ *SENSOR STUCK - {}* ⚠️\n\nDevice *{}* reported *{:.2}°C* for the last {} minutes.",
                escape_markdown(&sensor.identity.group.to_uppercase()),
                escape_markdown(&sensor.identity.device_id),
                sensor.value,
                minutes
            ));
        }

        Ok(newly_stuck)
    }
}

#[async_trait]
impl PeriodicJob for ConsistencyJob {
    fn name(&self) -> &'static str {
        "consistency job"
    }

    fn next_delay(&self, _: OffsetDateTime) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<(), JobError> {
        self.check(OffsetDateTime::now_utc()).await.map(|_| ())
    }
}
