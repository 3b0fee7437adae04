use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::models::{DeviceIdentity, MeasurementKind};
use crate::services::router::TopicRouter;

/// Latest values as group -> device -> kind -> value.
pub type LatestSnapshot = BTreeMap<String, BTreeMap<String, BTreeMap<MeasurementKind, Option<f64>>>>;

/// Authoritative latest value per device and measurement kind.
///
/// Entries are overwritten in place. The lock is only held for a single map
/// access or copy, never across alerting or I/O.
pub struct StateStore {
    latest: Mutex<HashMap<DeviceIdentity, BTreeMap<MeasurementKind, Option<f64>>>>,
}

impl StateStore {
    /// Starts with a null entry for every configured device and kind.
    pub fn new(router: &TopicRouter) -> Self {
        let latest = router
            .routes()
            .iter()
            .map(|route| {
                let kinds = route.kinds.iter().map(|kind| (*kind, None)).collect();
                (route.identity.clone(), kinds)
            })
            .collect();

        Self {
            latest: Mutex::new(latest),
        }
    }

    pub fn update(&self, identity: &DeviceIdentity, kind: MeasurementKind, value: f64) {
        let mut latest = self.latest.lock();
        match latest.get_mut(identity) {
            Some(kinds) => {
                kinds.insert(kind, Some(value));
            }
            None => {
                latest.insert(identity.clone(), BTreeMap::from([(kind, Some(value))]));
            }
        }
    }

    pub fn get(&self, identity: &DeviceIdentity, kind: MeasurementKind) -> Option<f64> {
        self.latest
            .lock()
            .get(identity)
            .and_then(|kinds| kinds.get(&kind).copied().flatten())
    }

    pub fn snapshot_all(&self) -> LatestSnapshot {
        let latest = self.latest.lock().clone();

        let mut snapshot = LatestSnapshot::new();
        for (identity, kinds) in latest {
            snapshot
                .entry(identity.group)
                .or_default()
                .insert(identity.device_id, kinds);
        }
        snapshot
    }

    /// Non-null values of one group, flattened for persistence.
    pub fn present_values(&self, group: &str) -> Vec<(DeviceIdentity, MeasurementKind, f64)> {
        let latest = self.latest.lock();

        latest
            .iter()
            .filter(|(identity, _)| identity.group == group)
            .flat_map(|(identity, kinds)| {
                kinds
                    .iter()
                    .filter_map(move |(kind, value)| value.map(|v| (identity.clone(), *kind, v)))
            })
            .collect()
    }
}
