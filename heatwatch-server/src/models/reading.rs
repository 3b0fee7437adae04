use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::Table;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MeasurementKind {
    Temperature,
    Humidity,
    Pressure,
    WaterLevel,
}

impl MeasurementKind {
    pub const ALL: [MeasurementKind; 4] = [
        MeasurementKind::Temperature,
        MeasurementKind::Humidity,
        MeasurementKind::Pressure,
        MeasurementKind::WaterLevel,
    ];

    /// The key used for this kind in structured payloads and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementKind::Temperature => "temperature",
            MeasurementKind::Humidity => "humidity",
            MeasurementKind::Pressure => "pressure",
            MeasurementKind::WaterLevel => "water_level",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            MeasurementKind::Temperature => "°C",
            MeasurementKind::Humidity => "%",
            MeasurementKind::Pressure => "hPa",
            MeasurementKind::WaterLevel => "cm",
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasurementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MeasurementKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown measurement kind: {s}"))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredReading {
    pub id: i64,
    /// The time of the snapshot, stored in UTC
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub group_name: String,
    pub device_id: String,
    pub kind: MeasurementKind,
    pub value: f64,
}

/// Readings of one day laid out as one row per snapshot time and one column per device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PivotTable {
    pub group: String,
    pub kind: MeasurementKind,
    pub devices: Vec<String>,
    pub rows: Vec<PivotRow>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PivotRow {
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub values: Vec<Option<f64>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceStatistics {
    pub device_id: String,
    pub kind: MeasurementKind,
    pub average: f64,
    pub minimum: f64,
    pub maximum: f64,
    pub count: i64,
}

#[derive(Clone)]
pub struct ReadingTable;

impl Table for ReadingTable {
    fn name(&self) -> &'static str {
        "readings"
    }

    fn create(&self) -> String {
        String::from(
            r#"
            CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                time TIMESTAMP NOT NULL,
                group_name VARCHAR(255) NOT NULL,
                device_id VARCHAR(255) NOT NULL,
                kind VARCHAR(32) NOT NULL,
                value REAL NOT NULL,
                FOREIGN KEY (group_name, device_id) REFERENCES devices (group_name, device_id)
            );
            CREATE INDEX IF NOT EXISTS readings_group_time ON readings (group_name, time);
            "#,
        )
    }

    fn dispose(&self) -> String {
        String::from("DROP TABLE IF EXISTS readings;")
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["devices"]
    }
}
