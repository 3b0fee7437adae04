use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::{Date, Duration, OffsetDateTime, UtcOffset};

use crate::configs::Storage;
use crate::errors::PersistenceError;
use crate::models::{
    DeviceIdentity, DeviceStatistics, MeasurementKind, PivotRow, PivotTable, StoredReading,
};
use crate::repositories::DeviceRepository;

/// Append/query interface over stored snapshot readings.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert_reading(
        &self,
        time: OffsetDateTime,
        identity: &DeviceIdentity,
        kind: MeasurementKind,
        value: f64,
    ) -> Result<i64, PersistenceError>;

    /// Inserts every entry with the same timestamp in one transaction.
    async fn insert_readings(
        &self,
        time: OffsetDateTime,
        readings: &[(DeviceIdentity, MeasurementKind, f64)],
    ) -> Result<u64, PersistenceError>;

    /// One row per stored timestamp of the local `date`, one column per device of `group`.
    async fn query_pivoted_by_date(
        &self,
        date: Date,
        group: &str,
        kind: MeasurementKind,
    ) -> Result<PivotTable, PersistenceError>;

    async fn query_recent(
        &self,
        limit: i64,
        group: &str,
    ) -> Result<Vec<StoredReading>, PersistenceError>;

    async fn query_since(
        &self,
        since: OffsetDateTime,
        group: &str,
    ) -> Result<Vec<StoredReading>, PersistenceError>;

    async fn query_statistics(
        &self,
        since: OffsetDateTime,
        group: &str,
    ) -> Result<Vec<DeviceStatistics>, PersistenceError>;
}

pub struct ReadingRepository {
    storage: Arc<Storage>,
    local_offset: UtcOffset,
}

impl ReadingRepository {
    pub fn new(storage: Arc<Storage>, local_offset: UtcOffset) -> Self {
        Self {
            storage,
            local_offset,
        }
    }
}

/// Stored times are UTC with whole seconds so that text comparison orders them.
fn storage_time(time: OffsetDateTime) -> OffsetDateTime {
    let utc = time.to_offset(UtcOffset::UTC);
    utc.replace_nanosecond(0).unwrap_or(utc)
}

#[async_trait]
impl Persistence for ReadingRepository {
    async fn insert_reading(
        &self,
        time: OffsetDateTime,
        identity: &DeviceIdentity,
        kind: MeasurementKind,
        value: f64,
    ) -> Result<i64, PersistenceError> {
        if !value.is_finite() {
            return Err(PersistenceError::InvalidValue(format!(
                "{identity} {kind} = {value}"
            )));
        }

        let id = sqlx::query(
            r#"
            INSERT INTO readings (time, group_name, device_id, kind, value)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(storage_time(time))
        .bind(&identity.group)
        .bind(&identity.device_id)
        .bind(kind)
        .bind(value)
        .execute(self.storage.get_pool())
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    async fn insert_readings(
        &self,
        time: OffsetDateTime,
        readings: &[(DeviceIdentity, MeasurementKind, f64)],
    ) -> Result<u64, PersistenceError> {
        let time = storage_time(time);
        let mut transaction = self.storage.get_pool().begin().await?;
        let mut inserted = 0;

        for (identity, kind, value) in readings {
            if !value.is_finite() {
                tracing::warn!("skipping non-finite {} reading of {}", kind, identity);
                continue;
            }

            inserted += sqlx::query(
                r#"
                INSERT INTO readings (time, group_name, device_id, kind, value)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(time)
            .bind(&identity.group)
            .bind(&identity.device_id)
            .bind(*kind)
            .bind(*value)
            .execute(&mut *transaction)
            .await?
            .rows_affected();
        }

        transaction.commit().await?;

        Ok(inserted)
    }

    async fn query_pivoted_by_date(
        &self,
        date: Date,
        group: &str,
        kind: MeasurementKind,
    ) -> Result<PivotTable, PersistenceError> {
        let devices = DeviceRepository::new(self.storage.clone())
            .find_by_group(group)
            .await?;

        let start = date.midnight().assume_offset(self.local_offset);
        let end = start + Duration::days(1);

        let readings: Vec<StoredReading> = sqlx::query_as(
            r#"
            SELECT * FROM readings
            WHERE group_name = $1 AND kind = $2 AND time >= $3 AND time < $4
            ORDER BY time ASC, id ASC
            "#,
        )
        .bind(group)
        .bind(kind)
        .bind(storage_time(start))
        .bind(storage_time(end))
        .fetch_all(self.storage.get_pool())
        .await?;

        let mut rows: BTreeMap<OffsetDateTime, Vec<Option<f64>>> = BTreeMap::new();
        for reading in readings {
            let Some(column) = devices.iter().position(|d| d.device_id == reading.device_id)
            else {
                continue;
            };

            let values = rows
                .entry(reading.time)
                .or_insert_with(|| vec![None; devices.len()]);
            values[column] = Some(reading.value);
        }

        Ok(PivotTable {
            group: group.to_string(),
            kind,
            devices: devices.into_iter().map(|d| d.device_id).collect(),
            rows: rows
                .into_iter()
                .map(|(time, values)| PivotRow {
                    time: time.to_offset(self.local_offset),
                    values,
                })
                .collect(),
        })
    }

    async fn query_recent(
        &self,
        limit: i64,
        group: &str,
    ) -> Result<Vec<StoredReading>, PersistenceError> {
        let readings: Vec<StoredReading> = sqlx::query_as(
            r#"
            SELECT * FROM readings
            WHERE group_name = $1
            ORDER BY time DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(group)
        .bind(limit)
        .fetch_all(self.storage.get_pool())
        .await?;

        Ok(readings)
    }

    async fn query_since(
        &self,
        since: OffsetDateTime,
        group: &str,
    ) -> Result<Vec<StoredReading>, PersistenceError> {
        let readings: Vec<StoredReading> = sqlx::query_as(
            r#"
            SELECT * FROM readings
            WHERE group_name = $1 AND time >= $2
            ORDER BY time ASC, id ASC
            "#,
        )
        .bind(group)
        .bind(storage_time(since))
        .fetch_all(self.storage.get_pool())
        .await?;

        Ok(readings)
    }

    async fn query_statistics(
        &self,
        since: OffsetDateTime,
        group: &str,
    ) -> Result<Vec<DeviceStatistics>, PersistenceError> {
        let statistics: Vec<DeviceStatistics> = sqlx::query_as(
            r#"
            SELECT r.device_id AS device_id,
                   r.kind AS kind,
                   AVG(r.value) AS average,
                   MIN(r.value) AS minimum,
                   MAX(r.value) AS maximum,
                   COUNT(*) AS count
            FROM readings r
            LEFT JOIN devices d
                ON d.group_name = r.group_name AND d.device_id = r.device_id
            WHERE r.group_name = $1 AND r.time >= $2
            GROUP BY r.device_id, r.kind
            ORDER BY MIN(d.position) ASC, r.kind ASC
            "#,
        )
        .bind(group)
        .bind(storage_time(since))
        .fetch_all(self.storage.get_pool())
        .await?;

        Ok(statistics)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::{date, datetime};

    use crate::configs::{Database, DeviceConf, SchemaManager};

    use super::*;

    const JAKARTA: UtcOffset = time::macros::offset!(+7);

    async fn setup_test_db() -> Arc<Storage> {
        let storage = Arc::new(
            Storage::new(
                Database {
                    migration_path: None,
                    clean_start: true,
                    url: String::from("sqlite::memory:"),
                },
                SchemaManager::default(),
            )
            .await
            .unwrap(),
        );

        let devices: Vec<DeviceConf> = ["dryer1", "dryer2", "dryer3"]
            .iter()
            .map(|id| DeviceConf {
                group: "dryer".to_string(),
                id: id.to_string(),
                topic: format!("esp32/{id}/temp"),
                kinds: vec![MeasurementKind::Temperature],
                alerting: true,
            })
            .collect();
        DeviceRepository::new(storage.clone())
            .sync(&devices)
            .await
            .unwrap();

        storage
    }

    fn dryer(id: &str) -> DeviceIdentity {
        DeviceIdentity::new("dryer", id)
    }

    #[tokio::test]
    async fn test_insert_and_query_since() {
        let storage = setup_test_db().await;
        let repo = ReadingRepository::new(storage.clone(), JAKARTA);

        let base = datetime!(2024-03-01 02:00:00 UTC);
        repo.insert_reading(base, &dryer("dryer1"), MeasurementKind::Temperature, 130.5)
            .await
            .unwrap();
        repo.insert_reading(
            base + Duration::minutes(10),
            &dryer("dryer1"),
            MeasurementKind::Temperature,
            131.0,
        )
        .await
        .unwrap();

        let readings = repo
            .query_since(base + Duration::minutes(5), "dryer")
            .await
            .unwrap();

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 131.0);
        assert_eq!(readings[0].kind, MeasurementKind::Temperature);
        assert_eq!(readings[0].time, base + Duration::minutes(10));
    }

    #[tokio::test]
    async fn test_insert_rejects_non_finite_values() {
        let storage = setup_test_db().await;
        let repo = ReadingRepository::new(storage.clone(), JAKARTA);

        let result = repo
            .insert_reading(
                OffsetDateTime::now_utc(),
                &dryer("dryer1"),
                MeasurementKind::Temperature,
                f64::NAN,
            )
            .await;

        assert!(matches!(result, Err(PersistenceError::InvalidValue(_))));
    }

    #[tokio::test]
    async fn test_query_recent_returns_newest_first() {
        let storage = setup_test_db().await;
        let repo = ReadingRepository::new(storage.clone(), JAKARTA);

        let base = datetime!(2024-03-01 02:00:00 UTC);
        for step in 0..5 {
            repo.insert_reading(
                base + Duration::minutes(10 * step),
                &dryer("dryer2"),
                MeasurementKind::Temperature,
                100.0 + step as f64,
            )
            .await
            .unwrap();
        }

        let recent = repo.query_recent(2, "dryer").await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].value, 104.0);
        assert_eq!(recent[1].value, 103.0);

        assert!(repo.query_recent(10, "boiler").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pivot_uses_local_day_and_device_order() {
        let storage = setup_test_db().await;
        let repo = ReadingRepository::new(storage.clone(), JAKARTA);

        // 2024-03-01 00:30 in UTC+7 is still 2024-02-29 in UTC
        let first = datetime!(2024-02-29 17:30:00 UTC);
        let second = datetime!(2024-03-01 03:00:00 UTC);
        let next_day = datetime!(2024-03-01 17:00:00 UTC);

        repo.insert_readings(
            first,
            &[
                (dryer("dryer3"), MeasurementKind::Temperature, 140.0),
                (dryer("dryer1"), MeasurementKind::Temperature, 130.0),
            ],
        )
        .await
        .unwrap();
        repo.insert_readings(
            second,
            &[(dryer("dryer2"), MeasurementKind::Temperature, 150.0)],
        )
        .await
        .unwrap();
        repo.insert_readings(
            next_day,
            &[(dryer("dryer2"), MeasurementKind::Temperature, 151.0)],
        )
        .await
        .unwrap();

        let pivot = repo
            .query_pivoted_by_date(date!(2024-03-01), "dryer", MeasurementKind::Temperature)
            .await
            .unwrap();

        assert_eq!(pivot.devices, vec!["dryer1", "dryer2", "dryer3"]);
        assert_eq!(pivot.rows.len(), 2);
        assert_eq!(pivot.rows[0].values, vec![Some(130.0), None, Some(140.0)]);
        assert_eq!(pivot.rows[0].time.offset(), JAKARTA);
        assert_eq!(pivot.rows[1].values, vec![None, Some(150.0), None]);
    }

    #[tokio::test]
    async fn test_statistics_per_device() {
        let storage = setup_test_db().await;
        let repo = ReadingRepository::new(storage.clone(), JAKARTA);

        let base = datetime!(2024-03-01 02:00:00 UTC);
        for (step, value) in [120.0, 130.0, 140.0].into_iter().enumerate() {
            repo.insert_readings(
                base + Duration::minutes(10 * step as i64),
                &[
                    (dryer("dryer1"), MeasurementKind::Temperature, value),
                    (dryer("dryer2"), MeasurementKind::Temperature, 100.0),
                ],
            )
            .await
            .unwrap();
        }

        let statistics = repo.query_statistics(base, "dryer").await.unwrap();

        assert_eq!(statistics.len(), 2);
        assert_eq!(statistics[0].device_id, "dryer1");
        assert_eq!(statistics[0].average, 130.0);
        assert_eq!(statistics[0].minimum, 120.0);
        assert_eq!(statistics[0].maximum, 140.0);
        assert_eq!(statistics[0].count, 3);
        assert_eq!(statistics[1].device_id, "dryer2");
        assert_eq!(statistics[1].average, 100.0);
    }
}
