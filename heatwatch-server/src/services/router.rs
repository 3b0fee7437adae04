use std::collections::HashMap;

use crate::configs::DeviceConf;
use crate::errors::RouteError;
use crate::models::{DeviceIdentity, MeasurementKind};

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceRoute {
    pub identity: DeviceIdentity,
    pub topic: String,
    pub kinds: Vec<MeasurementKind>,
    pub alerting: bool,
}

impl DeviceRoute {
    /// The kind a bare numeric payload from this device is read as.
    pub fn primary_kind(&self) -> MeasurementKind {
        self.kinds
            .first()
            .copied()
            .unwrap_or(MeasurementKind::Temperature)
    }

    pub fn accepts(&self, kind: MeasurementKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Whether temperature readings of this device go through the alert engine.
    pub fn is_alerting(&self) -> bool {
        self.alerting && self.accepts(MeasurementKind::Temperature)
    }
}

/// Static two-way table between transport topics and device identities.
#[derive(Debug, Default)]
pub struct TopicRouter {
    routes: Vec<DeviceRoute>,
    by_topic: HashMap<String, usize>,
    by_identity: HashMap<DeviceIdentity, usize>,
}

impl TopicRouter {
    pub fn new(devices: &[DeviceConf]) -> Result<Self, RouteError> {
        let mut router = TopicRouter::default();

        for device in devices {
            let identity = DeviceIdentity::new(&device.group, &device.id);
            let index = router.routes.len();

            if router.by_topic.contains_key(&device.topic) {
                return Err(RouteError::DuplicateTopic(device.topic.clone()));
            }
            if router.by_identity.contains_key(&identity) {
                return Err(RouteError::DuplicateDevice(identity.to_string()));
            }

            router.by_topic.insert(device.topic.clone(), index);
            router.by_identity.insert(identity.clone(), index);
            router.routes.push(DeviceRoute {
                identity,
                topic: device.topic.clone(),
                kinds: if device.kinds.is_empty() {
                    vec![MeasurementKind::Temperature]
                } else {
                    device.kinds.clone()
                },
                alerting: device.alerting,
            });
        }

        Ok(router)
    }

    pub fn resolve(&self, topic: &str) -> Result<&DeviceRoute, RouteError> {
        self.by_topic
            .get(topic)
            .map(|index| &self.routes[*index])
            .ok_or_else(|| RouteError::NotFound(topic.to_string()))
    }

    pub fn topic_for(&self, identity: &DeviceIdentity) -> Option<&str> {
        self.by_identity
            .get(identity)
            .map(|index| self.routes[*index].topic.as_str())
    }

    pub fn routes(&self) -> &[DeviceRoute] {
        &self.routes
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|route| route.topic.as_str())
    }

    /// Group names in configuration order, without repeats.
    pub fn groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = Vec::new();
        for route in &self.routes {
            if !groups.contains(&route.identity.group.as_str()) {
                groups.push(&route.identity.group);
            }
        }
        groups
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.routes.iter().any(|route| route.identity.group == group)
    }

    pub fn routes_in<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a DeviceRoute> {
        self.routes
            .iter()
            .filter(move |route| route.identity.group == group)
    }
}
