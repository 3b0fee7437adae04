use std::error::Error;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logger {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub min_temp: f64,
    pub max_temp: f64,
    pub temperature_offset: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mock {
    pub interval_secs: u64,
    /// Chance per reading that a device overshoots the upper limit
    pub excursion_chance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub group: String,
    pub id: String,
    pub topic: String,
    #[serde(default)]
    pub kinds: Vec<String>,
}

impl Device {
    pub fn reports_temperature(&self) -> bool {
        self.kinds.is_empty() || self.kinds.iter().any(|kind| kind == "temperature")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub logger: Logger,
    pub gateway: Gateway,
    pub alert: Alert,
    pub mock: Mock,
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl Settings {
    pub fn new() -> Result<Self, Box<dyn Error>> {
        let settings: Settings = toml::from_str(include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../",
            "configs/default.toml"
        )))?;

        Ok(settings)
    }
}
