use std::collections::{BTreeMap, HashMap};
use std::fmt;

use config::ConfigError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::configs::Alert;
use crate::models::DeviceIdentity;
use crate::services::notifier::escape_markdown;
use crate::services::router::TopicRouter;

const LOCAL_TIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertState {
    #[default]
    Normal,
    High,
    Low,
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertState::Normal => "NORMAL",
            AlertState::High => "HIGH",
            AlertState::Low => "LOW",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlertThresholds {
    pub min_temp: f64,
    pub max_temp: f64,
}

impl AlertThresholds {
    /// Both limits are strict: a value equal to a limit is still normal.
    pub fn classify(&self, value: f64) -> AlertState {
        if value > self.max_temp {
            AlertState::High
        } else if value < self.min_temp {
            AlertState::Low
        } else {
            AlertState::Normal
        }
    }
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            min_temp: 120.0,
            max_temp: 155.0,
        }
    }
}

/// Local hours `[start_hour, end_hour)` during which alerts may be sent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OperatingWindow {
    pub start_hour: u8,
    pub end_hour: u8,
    pub offset: UtcOffset,
}

impl OperatingWindow {
    pub fn always() -> Self {
        Self {
            start_hour: 0,
            end_hour: 24,
            offset: UtcOffset::UTC,
        }
    }

    pub fn local_time(&self, at: OffsetDateTime) -> OffsetDateTime {
        at.to_offset(self.offset)
    }

    pub fn contains(&self, at: OffsetDateTime) -> bool {
        let hour = self.local_time(at).hour();

        if self.start_hour <= self.end_hour {
            self.start_hour <= hour && hour < self.end_hour
        } else {
            // overnight window, e.g. 22..6
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlertPolicy {
    pub notify_all_clear: bool,
    pub reset_outside_window: bool,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            notify_all_clear: true,
            reset_outside_window: true,
        }
    }
}

/// A state transition worth telling someone about.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlertMessage {
    pub group: String,
    pub device_id: String,
    pub previous: AlertState,
    pub state: AlertState,
    pub value: f64,
    pub thresholds: (f64, f64),
    /// Local operating time of the reading
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl fmt::Display for AlertMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (min_temp, max_temp) = self.thresholds;
        let at = self.at.format(LOCAL_TIME_FORMAT).map_err(|_| fmt::Error)?;
        let device_id = escape_markdown(&self.device_id);
        let group = escape_markdown(&self.group);

        match self.state {
            AlertState::High => write!(
                f,
                "🔥 *HIGH TEMPERATURE ALERT* 🔥\n\n\
                 📍 Device: *{}* ({})\n\
                 🌡️ Current temperature: *{:.1}°C*\n\
                 📈 Upper limit: {:.1}°C\n\
                 🕒 Time: {}",
                device_id, group, self.value, max_temp, at
            ),
            AlertState::Low => write!(
                f,
                "❄️ *LOW TEMPERATURE ALERT* ❄️\n\n\
                 📍 Device: *{}* ({})\n\
                 🌡️ Current temperature: *{:.1}°C*\n\
                 📉 Lower limit: {:.1}°C\n\
                 🕒 Time: {}",
                device_id, group, self.value, min_temp, at
            ),
            AlertState::Normal => write!(
                f,
                "✅ *TEMPERATURE NORMAL* ✅\n\n\
                 📍 Device: *{}* ({})\n\
                 🌡️ Current temperature: *{:.1}°C*\n\
                 👍 Back within range ({:.1}°C - {:.1}°C)\n\
                 🕒 Time: {}",
                device_id, group, self.value, min_temp, max_temp, at
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    pub new_state: AlertState,
    pub transitioned: bool,
    pub message: Option<AlertMessage>,
}

impl Evaluation {
    fn unchanged(state: AlertState) -> Self {
        Self {
            new_state: state,
            transitioned: false,
            message: None,
        }
    }
}

/// Hysteresis alerting per device. Owns the alert-state table.
pub struct AlertEngine {
    thresholds: AlertThresholds,
    window: OperatingWindow,
    policy: AlertPolicy,
    states: Mutex<HashMap<DeviceIdentity, AlertState>>,
}

impl AlertEngine {
    pub fn new(
        thresholds: AlertThresholds,
        window: OperatingWindow,
        policy: AlertPolicy,
        devices: impl IntoIterator<Item = DeviceIdentity>,
    ) -> Self {
        let states = devices
            .into_iter()
            .map(|identity| (identity, AlertState::Normal))
            .collect();

        Self {
            thresholds,
            window,
            policy,
            states: Mutex::new(states),
        }
    }

    /// Builds the engine for every alerting device of the router.
    pub fn from_settings(alert: &Alert, router: &TopicRouter) -> Result<Self, ConfigError> {
        let window = OperatingWindow {
            start_hour: alert.operating_start_hour,
            end_hour: alert.operating_end_hour,
            offset: alert.utc_offset()?,
        };
        let devices = router
            .routes()
            .iter()
            .filter(|route| route.is_alerting())
            .map(|route| route.identity.clone());

        Ok(Self::new(
            AlertThresholds {
                min_temp: alert.min_temp,
                max_temp: alert.max_temp,
            },
            window,
            AlertPolicy {
                notify_all_clear: alert.notify_all_clear,
                reset_outside_window: alert.reset_outside_window,
            },
            devices,
        ))
    }

    pub fn thresholds(&self) -> AlertThresholds {
        self.thresholds
    }

    pub fn window(&self) -> OperatingWindow {
        self.window
    }

    /// Decides the next state without touching the table.
    pub fn evaluate(
        &self,
        identity: &DeviceIdentity,
        value: Option<f64>,
        prior: AlertState,
        at: OffsetDateTime,
    ) -> Evaluation {
        let Some(value) = value.filter(|v| v.is_finite()) else {
            return Evaluation::unchanged(prior);
        };

        if !self.window.contains(at) {
            let new_state = if self.policy.reset_outside_window {
                AlertState::Normal
            } else {
                self.thresholds.classify(value)
            };

            return Evaluation {
                new_state,
                transitioned: new_state != prior,
                message: None,
            };
        }

        let new_state = self.thresholds.classify(value);
        if new_state == prior {
            return Evaluation::unchanged(prior);
        }

        let notify = new_state != AlertState::Normal || self.policy.notify_all_clear;
        let message = notify.then(|| AlertMessage {
            group: identity.group.clone(),
            device_id: identity.device_id.clone(),
            previous: prior,
            state: new_state,
            value,
            thresholds: (self.thresholds.min_temp, self.thresholds.max_temp),
            at: self.window.local_time(at),
        });

        Evaluation {
            new_state,
            transitioned: true,
            message,
        }
    }

    /// Read, evaluate and write the device's state under the table lock.
    pub fn observe(
        &self,
        identity: &DeviceIdentity,
        value: Option<f64>,
        at: OffsetDateTime,
    ) -> Evaluation {
        let mut states = self.states.lock();
        let prior = states.get(identity).copied().unwrap_or_default();

        let evaluation = self.evaluate(identity, value, prior, at);
        if evaluation.transitioned {
            states.insert(identity.clone(), evaluation.new_state);
        }

        evaluation
    }

    pub fn state_of(&self, identity: &DeviceIdentity) -> AlertState {
        self.states.lock().get(identity).copied().unwrap_or_default()
    }

    /// Alert states as group -> device -> state.
    pub fn states(&self) -> BTreeMap<String, BTreeMap<String, AlertState>> {
        let states = self.states.lock().clone();

        let mut grouped: BTreeMap<String, BTreeMap<String, AlertState>> = BTreeMap::new();
        for (identity, state) in states {
            grouped
                .entry(identity.group)
                .or_default()
                .insert(identity.device_id, state);
        }
        grouped
    }
}
