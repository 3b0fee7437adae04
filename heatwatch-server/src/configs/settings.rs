use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use time::UtcOffset;

use crate::configs::normalize_path;
use crate::models::MeasurementKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logger {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub reconnect_initial_secs: u64,
    pub reconnect_max_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub migration_path: Option<String>,
    pub clean_start: bool,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub min_temp: f64,
    pub max_temp: f64,
    /// Calibration added to every decoded temperature
    pub temperature_offset: f64,
    /// Offset of the plant's local time from UTC
    pub utc_offset_hours: i8,
    pub operating_start_hour: u8,
    pub operating_end_hour: u8,
    pub notify_all_clear: bool,
    pub reset_outside_window: bool,
}

impl Alert {
    pub fn utc_offset(&self) -> Result<UtcOffset, ConfigError> {
        UtcOffset::from_hms(self.utc_offset_hours, 0, 0)
            .map_err(|e| ConfigError::Message(format!("invalid utc offset: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub telegram_token: Option<String>,
    pub chat_id: Option<String>,
    pub api_base: String,
    pub queue_capacity: usize,
    pub request_timeout_secs: u64,
    /// Answer chat commands from the configured chat
    #[serde(default = "default_commands_enabled")]
    pub commands_enabled: bool,
    /// Long-poll timeout of getUpdates
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

fn default_commands_enabled() -> bool {
    true
}

fn default_poll_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub snapshot_interval_secs: u64,
    pub consistency_interval_secs: u64,
    pub consistency_window_secs: u64,
    pub keepalive_interval_secs: u64,
    pub keepalive_url: Option<String>,
    pub report_dir: Option<String>,
}

impl Schedule {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn consistency_interval(&self) -> Duration {
        Duration::from_secs(self.consistency_interval_secs)
    }

    pub fn consistency_window(&self) -> Duration {
        Duration::from_secs(self.consistency_window_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConf {
    pub group: String,
    pub id: String,
    pub topic: String,
    #[serde(default = "default_kinds")]
    pub kinds: Vec<MeasurementKind>,
    #[serde(default = "default_alerting")]
    pub alerting: bool,
}

fn default_kinds() -> Vec<MeasurementKind> {
    vec![MeasurementKind::Temperature]
}

fn default_alerting() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: Server,
    pub logger: Logger,
    pub gateway: Gateway,
    pub database: Database,
    pub alert: Alert,
    pub notification: Notification,
    pub schedule: Schedule,
    #[serde(default)]
    pub devices: Vec<DeviceConf>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or("development".into());

        let mut settings: Settings = Config::builder()
            .add_source(File::with_name("configs/default"))
            .add_source(File::with_name(&format!("configs/{run_mode}")).required(false))
            .add_source(
                Environment::with_prefix("HEATWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        if let Some(migrate) = &settings.database.migration_path {
            if Path::new(migrate).is_dir() {
                let migrate_path = normalize_path(migrate)
                    .map_err(|e| ConfigError::Message(e.to_string()))?
                    .to_string_lossy()
                    .to_string();

                settings.database.migration_path = Some(migrate_path);
            } else {
                settings.database.migration_path = None;
            }
        }

        if let Some(report_dir) = &settings.schedule.report_dir {
            let report_path = normalize_path(report_dir)
                .map_err(|e| ConfigError::Message(e.to_string()))?
                .to_string_lossy()
                .to_string();

            settings.schedule.report_dir = Some(report_path);
        }

        settings.validate()?;

        Ok(settings)
    }

    /// Builds settings from a single TOML document, without file or environment layering.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        settings.validate()?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let alert = &self.alert;
        if alert.min_temp >= alert.max_temp {
            return Err(ConfigError::Message(format!(
                "alert.min_temp ({}) must be below alert.max_temp ({})",
                alert.min_temp, alert.max_temp
            )));
        }
        if alert.operating_start_hour > 24 || alert.operating_end_hour > 24 {
            return Err(ConfigError::Message(
                "operating hours must be within 0..=24".into(),
            ));
        }
        alert.utc_offset()?;

        let gateway = &self.gateway;
        if gateway.reconnect_initial_secs == 0
            || gateway.reconnect_initial_secs > gateway.reconnect_max_secs
        {
            return Err(ConfigError::Message(format!(
                "gateway reconnect delays must satisfy 0 < initial ({}) <= max ({})",
                gateway.reconnect_initial_secs, gateway.reconnect_max_secs
            )));
        }

        if self.notification.queue_capacity == 0 {
            return Err(ConfigError::Message(
                "notification.queue_capacity must be positive".into(),
            ));
        }

        let mut topics = HashSet::new();
        for device in &self.devices {
            // group names end up in report file names and url paths
            let group = device.group.as_str();
            if group.is_empty() || group == ".." || group.contains(['/', '\\']) {
                return Err(ConfigError::Message(format!(
                    "invalid group name {:?} for device {}",
                    device.group, device.id
                )));
            }

            if !topics.insert(device.topic.as_str()) {
                return Err(ConfigError::Message(format!(
                    "topic {} is assigned to more than one device",
                    device.topic
                )));
            }
        }

        Ok(())
    }

    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for device in &self.devices {
            if !groups.contains(&device.group) {
                groups.push(device.group.clone());
            }
        }
        groups
    }
}
