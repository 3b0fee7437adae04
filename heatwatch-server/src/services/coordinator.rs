use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::errors::DecodeError;
use crate::models::{DeviceIdentity, MeasurementKind};
use crate::services::alert_engine::{AlertEngine, AlertMessage, AlertState};
use crate::services::decoder;
use crate::services::notifier::NotificationDispatcher;
use crate::services::router::TopicRouter;
use crate::services::state_store::StateStore;

#[derive(Clone, Debug, PartialEq)]
pub enum IngestOutcome {
    Accepted {
        identity: DeviceIdentity,
        /// Number of non-null measurements written to the state store
        stored: usize,
        /// New alert state when this message caused a transition
        transition: Option<AlertState>,
    },
    Rejected(DecodeError),
    Unrouted,
    Failed,
}

/// Single entry point for inbound device messages.
///
/// The whole ingest path runs synchronously on the caller. Only the
/// notification hand-off leaves this path, and it never blocks.
pub struct Coordinator {
    router: Arc<TopicRouter>,
    store: Arc<StateStore>,
    alerts: Arc<AlertEngine>,
    dispatcher: NotificationDispatcher,
    events: broadcast::Sender<AlertMessage>,
    temperature_offset: f64,
}

impl Coordinator {
    pub fn new(
        router: Arc<TopicRouter>,
        store: Arc<StateStore>,
        alerts: Arc<AlertEngine>,
        dispatcher: NotificationDispatcher,
        events: broadcast::Sender<AlertMessage>,
        temperature_offset: f64,
    ) -> Self {
        Self {
            router,
            store,
            alerts,
            dispatcher,
            events,
            temperature_offset,
        }
    }

    pub fn on_message(&self, topic: &str, payload: &[u8]) -> IngestOutcome {
        self.on_message_at(topic, payload, OffsetDateTime::now_utc())
    }

    pub fn on_message_at(&self, topic: &str, payload: &[u8], at: OffsetDateTime) -> IngestOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.ingest(topic, payload, at))) {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(
                    "panic while ingesting message from {}: {}",
                    topic,
                    String::from_utf8_lossy(payload)
                );
                IngestOutcome::Failed
            }
        }
    }

    fn ingest(&self, topic: &str, payload: &[u8], at: OffsetDateTime) -> IngestOutcome {
        let decoded = match decoder::decode(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(
                    "rejected payload from {}: {} ({})",
                    topic,
                    String::from_utf8_lossy(payload),
                    e
                );
                return IngestOutcome::Rejected(e);
            }
        };

        let route = match self.router.resolve(topic) {
            Ok(route) => route,
            Err(e) => {
                tracing::debug!("{}", e);
                return IngestOutcome::Unrouted;
            }
        };

        let mut stored = 0;
        let mut temperature = None;
        for reading in decoded.readings(route.primary_kind(), at) {
            if !route.accepts(reading.kind) {
                tracing::debug!("{} does not report {}, ignoring", route.identity, reading.kind);
                continue;
            }

            let value = match reading.kind {
                MeasurementKind::Temperature => {
                    let adjusted = reading.value.map(|v| v + self.temperature_offset);
                    temperature = Some(adjusted);
                    adjusted
                }
                _ => reading.value,
            };

            if let Some(value) = value {
                self.store.update(&route.identity, reading.kind, value);
                stored += 1;
            }
        }

        let mut transition = None;
        if let Some(value) = temperature.filter(|_| route.is_alerting()) {
            let evaluation = self.alerts.observe(&route.identity, value, at);

            if evaluation.transitioned {
                transition = Some(evaluation.new_state);
            }
            if let Some(message) = evaluation.message {
                tracing::warn!(
                    "{} went {} -> {} at {:.1}",
                    route.identity,
                    message.previous,
                    message.state,
                    message.value
                );
                self.dispatcher.enqueue(message.to_string());
                // no subscribers is fine
                let _ = self.events.send(message);
            }
        }

        tracing::info!(
            "accepted {} measurement(s) from {} ({})",
            stored,
            route.identity,
            topic
        );

        IngestOutcome::Accepted {
            identity: route.identity.clone(),
            stored,
            transition,
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::{datetime, offset};
    use tokio::sync::mpsc;

    use crate::configs::DeviceConf;
    use crate::services::alert_engine::{AlertPolicy, AlertThresholds, OperatingWindow};
    use crate::services::notifier::Notification;

    use super::*;

    const OPEN: OffsetDateTime = datetime!(2024-03-01 03:00:00 UTC);

    struct Fixture {
        coordinator: Coordinator,
        store: Arc<StateStore>,
        queue: mpsc::Receiver<Notification>,
        events: broadcast::Receiver<AlertMessage>,
    }

    fn fixture(temperature_offset: f64) -> Fixture {
        let humidity = DeviceConf {
            group: "kedi".to_string(),
            id: "humidity4".to_string(),
            topic: "esp32/humidity4".to_string(),
            kinds: vec![MeasurementKind::Humidity],
            alerting: false,
        };
        let devices = vec![
            DeviceConf {
                group: "grp-A".to_string(),
                id: "dev-1".to_string(),
                topic: "grp-A/dev-1".to_string(),
                kinds: vec![MeasurementKind::Temperature],
                alerting: true,
            },
            humidity,
        ];

        let router = Arc::new(TopicRouter::new(&devices).unwrap());
        let store = Arc::new(StateStore::new(&router));
        let alerts = Arc::new(AlertEngine::new(
            AlertThresholds::default(),
            OperatingWindow {
                start_hour: 6,
                end_hour: 17,
                offset: offset!(+7),
            },
            AlertPolicy::default(),
            [DeviceIdentity::new("grp-A", "dev-1")],
        ));
        let (dispatcher, queue) = NotificationDispatcher::channel(8);
        let (sender, events) = broadcast::channel(8);

        Fixture {
            coordinator: Coordinator::new(
                router,
                store.clone(),
                alerts,
                dispatcher,
                sender,
                temperature_offset,
            ),
            store,
            queue,
            events,
        }
    }

    #[test]
    fn test_end_to_end_high_alert() {
        let mut fixture = fixture(0.0);
        let identity = DeviceIdentity::new("grp-A", "dev-1");

        let outcome = fixture.coordinator.on_message_at("grp-A/dev-1", b"160.0", OPEN);

        assert_eq!(
            outcome,
            IngestOutcome::Accepted {
                identity: identity.clone(),
                stored: 1,
                transition: Some(AlertState::High),
            }
        );
        assert_eq!(
            fixture.store.get(&identity, MeasurementKind::Temperature),
            Some(160.0)
        );

        let Ok(Notification::Text(text)) = fixture.queue.try_recv() else {
            panic!("expected one queued message");
        };
        assert!(text.contains("dev-1"));
        assert!(text.contains("160.0"));
        assert!(fixture.queue.try_recv().is_err());

        let event = fixture.events.try_recv().unwrap();
        assert_eq!(event.state, AlertState::High);
    }

    #[test]
    fn test_repeated_readings_notify_once() {
        let mut fixture = fixture(0.0);

        for _ in 0..3 {
            fixture.coordinator.on_message_at("grp-A/dev-1", b"160", OPEN);
        }

        assert!(fixture.queue.try_recv().is_ok());
        assert!(fixture.queue.try_recv().is_err());
    }

    #[test]
    fn test_unrouted_topic_leaves_state_untouched() {
        let fixture = fixture(0.0);
        let before = fixture.store.snapshot_all();

        let outcome = fixture.coordinator.on_message_at("grp-A/dev-9", b"160.0", OPEN);

        assert_eq!(outcome, IngestOutcome::Unrouted);
        assert_eq!(fixture.store.snapshot_all(), before);
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let fixture = fixture(0.0);
        let before = fixture.store.snapshot_all();

        let outcome = fixture.coordinator.on_message_at("grp-A/dev-1", b"overheated", OPEN);

        assert!(matches!(outcome, IngestOutcome::Rejected(DecodeError::NotNumeric(_))));
        assert_eq!(fixture.store.snapshot_all(), before);
    }

    #[test]
    fn test_temperature_offset_is_applied_before_alerting() {
        let mut fixture = fixture(12.6);
        let identity = DeviceIdentity::new("grp-A", "dev-1");

        // 145.0 raw is 157.6 after calibration
        let outcome = fixture.coordinator.on_message_at("grp-A/dev-1", b"145.0", OPEN);

        assert!(matches!(
            outcome,
            IngestOutcome::Accepted { transition: Some(AlertState::High), .. }
        ));
        let stored = fixture
            .store
            .get(&identity, MeasurementKind::Temperature)
            .unwrap();
        assert!((stored - 157.6).abs() < 1e-9);
        assert!(fixture.queue.try_recv().is_ok());
    }

    #[test]
    fn test_null_temperature_keeps_last_value() {
        let mut fixture = fixture(0.0);
        let identity = DeviceIdentity::new("grp-A", "dev-1");

        fixture.coordinator.on_message_at("grp-A/dev-1", b"130.0", OPEN);
        let outcome = fixture.coordinator.on_message_at(
            "grp-A/dev-1",
            br#"{"temperature": "n/a"}"#,
            OPEN,
        );

        assert_eq!(
            outcome,
            IngestOutcome::Accepted {
                identity: identity.clone(),
                stored: 0,
                transition: None,
            }
        );
        assert_eq!(
            fixture.store.get(&identity, MeasurementKind::Temperature),
            Some(130.0)
        );
        assert!(fixture.queue.try_recv().is_err());
    }

    #[test]
    fn test_humidity_device_is_stored_but_never_alerts() {
        let mut fixture = fixture(12.6);
        let identity = DeviceIdentity::new("kedi", "humidity4");

        let outcome = fixture.coordinator.on_message_at(
            "esp32/humidity4",
            br#"{"humidity": 61.5, "temperature": 500}"#,
            OPEN,
        );

        assert!(matches!(outcome, IngestOutcome::Accepted { stored: 1, transition: None, .. }));
        assert_eq!(
            fixture.store.get(&identity, MeasurementKind::Humidity),
            Some(61.5)
        );
        assert_eq!(fixture.store.get(&identity, MeasurementKind::Temperature), None);
        assert!(fixture.queue.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_messages_for_distinct_devices() {
        let devices: Vec<DeviceConf> = (0..8)
            .map(|i| DeviceConf {
                group: "dryer".to_string(),
                id: format!("dryer{i}"),
                topic: format!("esp32/dryer{i}/temp"),
                kinds: vec![MeasurementKind::Temperature],
                alerting: true,
            })
            .collect();
        let router = Arc::new(TopicRouter::new(&devices).unwrap());
        let store = Arc::new(StateStore::new(&router));
        let alerts = Arc::new(AlertEngine::new(
            AlertThresholds::default(),
            OperatingWindow::always(),
            AlertPolicy::default(),
            router.routes().iter().map(|route| route.identity.clone()),
        ));
        let (dispatcher, _queue) = NotificationDispatcher::channel(16);
        let (sender, _events) = broadcast::channel(16);
        let coordinator = Arc::new(Coordinator::new(
            router, store.clone(), alerts, dispatcher, sender, 0.0,
        ));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let coordinator = coordinator.clone();
                std::thread::spawn(move || {
                    let payload = format!("{}", 130 + i);
                    coordinator.on_message(&format!("esp32/dryer{i}/temp"), payload.as_bytes())
                })
            })
            .collect();
        for handle in handles {
            assert!(matches!(handle.join().unwrap(), IngestOutcome::Accepted { .. }));
        }

        let snapshot = store.snapshot_all();
        for i in 0..8 {
            assert_eq!(
                snapshot["dryer"][&format!("dryer{i}")][&MeasurementKind::Temperature],
                Some((130 + i) as f64)
            );
        }
    }
}
