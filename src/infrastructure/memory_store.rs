// In-memory retention store for dry runs
use crate::application::retention_store::{RetentionStore, UpsertOutcome};
use crate::domain::error::StoreError;
use crate::domain::metrics::DerivedMetrics;
use crate::domain::reading::{ReadingKey, TelemetryReading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct MemoryRetentionStore {
    readings: Arc<RwLock<BTreeMap<ReadingKey, TelemetryReading>>>,
    metrics: Arc<RwLock<HashMap<(String, String), DerivedMetrics>>>,
}

impl MemoryRetentionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reading_count(&self) -> usize {
        self.readings.read().await.len()
    }

    pub async fn metrics_for(&self, site_id: &str, tank_id: &str) -> Option<DerivedMetrics> {
        self.metrics
            .read()
            .await
            .get(&(site_id.to_string(), tank_id.to_string()))
            .cloned()
    }

    pub async fn metrics_count(&self) -> usize {
        self.metrics.read().await.len()
    }
}

#[async_trait]
impl RetentionStore for MemoryRetentionStore {
    async fn test_connectivity(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_reading(&self, reading: &TelemetryReading) -> Result<UpsertOutcome, StoreError> {
        let mut readings = self.readings.write().await;
        let key = reading.key();
        if readings.contains_key(&key) {
            return Ok(UpsertOutcome::Duplicate);
        }
        readings.insert(key, reading.clone());
        Ok(UpsertOutcome::Inserted)
    }

    async fn upsert_readings(&self, batch: &[TelemetryReading]) -> Result<usize, StoreError> {
        let mut readings = self.readings.write().await;
        let mut inserted = 0;
        for reading in batch {
            let key = reading.key();
            if !readings.contains_key(&key) {
                readings.insert(key, reading.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn upsert_derived_metrics(
        &self,
        site_id: &str,
        tank_id: &str,
        metrics: &DerivedMetrics,
    ) -> Result<(), StoreError> {
        self.metrics
            .write()
            .await
            .insert((site_id.to_string(), tank_id.to_string()), metrics.clone());
        Ok(())
    }

    async fn readings_since(
        &self,
        site_id: &str,
        tank_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<TelemetryReading>, StoreError> {
        let readings = self.readings.read().await;
        let from = ReadingKey {
            site_id: site_id.to_string(),
            tank_id: tank_id.to_string(),
            recorded_at: since,
        };

        Ok(readings
            .range(from..)
            .take_while(|(key, _)| key.site_id == site_id && key.tank_id == tank_id)
            .map(|(_, reading)| reading.clone())
            .collect())
    }

    async fn delete_older_than(&self, max_age: chrono::Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - max_age;
        let mut readings = self.readings.write().await;
        let before = readings.len();
        readings.retain(|key, _| key.recorded_at >= cutoff);
        Ok((before - readings.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn reading(site: &str, tank: &str, recorded_at: DateTime<Utc>) -> TelemetryReading {
        TelemetryReading::new(site.to_string(), tank.to_string(), recorded_at)
    }

    #[tokio::test]
    async fn test_same_identity_is_stored_once() {
        let store = MemoryRetentionStore::new();
        let at = Utc::now();
        let mut first = reading("s1", "1", at);
        first.volume = 1000.0;
        let mut second = first.clone();
        second.volume = 750.0;

        assert_eq!(store.upsert_reading(&first).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_reading(&second).await.unwrap(), UpsertOutcome::Duplicate);
        assert_eq!(store.reading_count().await, 1);

        let stored = store.readings_since("s1", "1", at).await.unwrap();
        assert_eq!(stored[0].volume, 1000.0);
    }

    #[tokio::test]
    async fn test_batch_upsert_counts_new_rows() {
        let store = MemoryRetentionStore::new();
        let now = Utc::now();
        let batch: Vec<_> = (0..4).map(|i| reading("s1", "1", now - Duration::hours(i))).collect();

        assert_eq!(store.upsert_readings(&batch).await.unwrap(), 4);
        assert_eq!(store.upsert_readings(&batch[1..]).await.unwrap(), 0);
        assert_eq!(store.reading_count().await, 4);
    }

    #[tokio::test]
    async fn test_readings_since_is_scoped_and_ordered() {
        let store = MemoryRetentionStore::new();
        let now = Utc::now();
        for hours in [30, 10, 2, 5] {
            store.upsert_reading(&reading("s1", "1", now - Duration::hours(hours))).await.unwrap();
        }
        store.upsert_reading(&reading("s1", "2", now)).await.unwrap();
        store.upsert_reading(&reading("s2", "1", now)).await.unwrap();

        let history = store.readings_since("s1", "1", now - Duration::hours(24)).await.unwrap();
        let ages: Vec<i64> = history.iter().map(|r| (now - r.recorded_at).num_hours()).collect();
        assert_eq!(ages, vec![10, 5, 2]);
    }

    #[tokio::test]
    async fn test_delete_older_than_keeps_newer_readings() {
        let store = MemoryRetentionStore::new();
        let now = Utc::now();
        for days in [9, 6, 4, 1] {
            store.upsert_reading(&reading("s1", "1", now - Duration::days(days))).await.unwrap();
        }

        let removed = store.delete_older_than(Duration::days(5)).await.unwrap();
        assert_eq!(removed, 2);

        let remaining = store.readings_since("s1", "1", now - Duration::days(30)).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|r| now - r.recorded_at < Duration::days(5)));
    }

    #[tokio::test]
    async fn test_metrics_are_overwritten() {
        let store = MemoryRetentionStore::new();
        let mut metrics = DerivedMetrics::empty(Utc::now());
        store.upsert_derived_metrics("s1", "1", &metrics).await.unwrap();
        metrics.run_rate_gph = 14.0;
        store.upsert_derived_metrics("s1", "1", &metrics).await.unwrap();

        assert_eq!(store.metrics_count().await, 1);
        assert_eq!(store.metrics_for("s1", "1").await.unwrap().run_rate_gph, 14.0);
    }
}
