use std::fmt;

use serde::{Deserialize, Serialize};

use super::Table;

/// A configured device as registered in storage.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub group_name: String,
    pub device_id: String,
    pub topic: String,
    /// Position of the device in the configuration, used as column order
    pub position: i64,
}

/// Where a reading comes from: the system group and the device inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub group: String,
    pub device_id: String,
}

impl DeviceIdentity {
    pub fn new(group: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.device_id)
    }
}

#[derive(Clone)]
pub struct DeviceTable;

impl Table for DeviceTable {
    fn name(&self) -> &'static str {
        "devices"
    }

    fn create(&self) -> String {
        String::from(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                group_name VARCHAR(255) NOT NULL,
                device_id VARCHAR(255) NOT NULL,
                topic VARCHAR(255) NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (group_name, device_id)
            );
            "#,
        )
    }

    fn dispose(&self) -> String {
        String::from("DROP TABLE IF EXISTS devices;")
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![]
    }
}
