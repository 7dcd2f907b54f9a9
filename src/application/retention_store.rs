// Repository trait for persisted readings and metrics
use crate::domain::error::StoreError;
use crate::domain::metrics::DerivedMetrics;
use crate::domain::reading::TelemetryReading;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// A reading with the same identity already existed. Not an error.
    Duplicate,
}

#[async_trait]
pub trait RetentionStore: Send + Sync {
    async fn test_connectivity(&self) -> Result<(), StoreError>;

    async fn upsert_reading(&self, reading: &TelemetryReading) -> Result<UpsertOutcome, StoreError>;

    /// Batch variant of `upsert_reading`. Returns how many rows were new.
    async fn upsert_readings(&self, readings: &[TelemetryReading]) -> Result<usize, StoreError>;

    async fn upsert_derived_metrics(
        &self,
        site_id: &str,
        tank_id: &str,
        metrics: &DerivedMetrics,
    ) -> Result<(), StoreError>;

    /// Readings of one tank recorded at or after `since`, oldest first
    async fn readings_since(
        &self,
        site_id: &str,
        tank_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<TelemetryReading>, StoreError>;

    /// Remove readings older than `max_age`. Returns the number removed.
    async fn delete_older_than(&self, max_age: chrono::Duration) -> Result<u64, StoreError>;
}
