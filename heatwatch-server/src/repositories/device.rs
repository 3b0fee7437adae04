use std::sync::Arc;

use crate::configs::{DeviceConf, Storage};
use crate::errors::PersistenceError;
use crate::models::Device;

pub struct DeviceRepository {
    storage: Arc<Storage>,
}

impl DeviceRepository {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeviceRepository {
    /// Registers the configured devices, refreshing topic and position of known ones.
    pub async fn sync(&self, devices: &[DeviceConf]) -> Result<(), PersistenceError> {
        let mut transaction = self.storage.get_pool().begin().await?;

        for (position, device) in devices.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO devices (group_name, device_id, topic, position)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (group_name, device_id)
                DO UPDATE SET topic = excluded.topic, position = excluded.position
                "#,
            )
            .bind(&device.group)
            .bind(&device.id)
            .bind(&device.topic)
            .bind(position as i64)
            .execute(&mut *transaction)
            .await?;
        }

        transaction.commit().await?;

        Ok(())
    }

    pub async fn find_by_group(&self, group: &str) -> Result<Vec<Device>, PersistenceError> {
        let devices: Vec<Device> = sqlx::query_as(
            "SELECT * FROM devices WHERE group_name = $1 ORDER BY position ASC",
        )
        .bind(group)
        .fetch_all(self.storage.get_pool())
        .await?;

        Ok(devices)
    }

    pub async fn find_all(&self) -> Result<Vec<Device>, PersistenceError> {
        let devices: Vec<Device> = sqlx::query_as("SELECT * FROM devices ORDER BY position ASC")
            .fetch_all(self.storage.get_pool())
            .await?;

        Ok(devices)
    }
}
