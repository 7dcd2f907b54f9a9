// REST retention store - PostgREST-style tables and a cleanup procedure
use crate::application::retention_store::{RetentionStore, UpsertOutcome};
use crate::domain::error::StoreError;
use crate::domain::metrics::DerivedMetrics;
use crate::domain::reading::TelemetryReading;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::time::Duration;

const READINGS_TABLE: &str = "tank_logs";
const METRICS_TABLE: &str = "tank_metrics";
const READING_CONFLICT_COLUMNS: &str = "site_id,tank_id,recorded_at";
const METRICS_CONFLICT_COLUMNS: &str = "site_id,tank_id";

#[derive(Debug, Clone)]
pub struct RestRetentionStore {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
    cleanup_procedure: String,
}

#[derive(Debug, Serialize)]
struct MetricsRow<'a> {
    site_id: &'a str,
    tank_id: &'a str,
    #[serde(flatten)]
    metrics: &'a DerivedMetrics,
}

#[derive(Debug, Serialize)]
struct CleanupArgs {
    cutoff: String,
}

impl RestRetentionStore {
    pub fn new(
        base_url: String,
        service_key: String,
        cleanup_procedure: String,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            cleanup_procedure,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Accept", "application/json")
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status { status, body });
        }

        Ok(response)
    }

    /// Insert rows, skipping identities that already exist. Returns the rows actually written.
    async fn insert_ignoring_duplicates(&self, rows: &[TelemetryReading]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let url = format!(
            "{}?on_conflict={}",
            self.table_url(READINGS_TABLE),
            READING_CONFLICT_COLUMNS
        );
        let request = self
            .client
            .post(&url)
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(rows);

        let inserted = self
            .send(request)
            .await?
            .json::<Vec<serde_json::Value>>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        Ok(inserted.len())
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl RetentionStore for RestRetentionStore {
    async fn test_connectivity(&self) -> Result<(), StoreError> {
        let url = format!("{}?select=site_id&limit=1", self.table_url(READINGS_TABLE));
        self.send(self.client.get(&url)).await?;
        Ok(())
    }

    async fn upsert_reading(&self, reading: &TelemetryReading) -> Result<UpsertOutcome, StoreError> {
        let inserted = self
            .insert_ignoring_duplicates(std::slice::from_ref(reading))
            .await?;

        if inserted == 0 {
            Ok(UpsertOutcome::Duplicate)
        } else {
            Ok(UpsertOutcome::Inserted)
        }
    }

    async fn upsert_readings(&self, readings: &[TelemetryReading]) -> Result<usize, StoreError> {
        self.insert_ignoring_duplicates(readings).await
    }

    async fn upsert_derived_metrics(
        &self,
        site_id: &str,
        tank_id: &str,
        metrics: &DerivedMetrics,
    ) -> Result<(), StoreError> {
        let url = format!(
            "{}?on_conflict={}",
            self.table_url(METRICS_TABLE),
            METRICS_CONFLICT_COLUMNS
        );
        let row = MetricsRow {
            site_id,
            tank_id,
            metrics,
        };
        let request = self
            .client
            .post(&url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row]);

        self.send(request).await?;
        Ok(())
    }

    async fn readings_since(
        &self,
        site_id: &str,
        tank_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<TelemetryReading>, StoreError> {
        let url = format!(
            "{}?select=*&site_id=eq.{}&tank_id=eq.{}&recorded_at=gte.{}&order=recorded_at.asc",
            self.table_url(READINGS_TABLE),
            urlencoding::encode(site_id),
            urlencoding::encode(tank_id),
            urlencoding::encode(&timestamp(since)),
        );

        tracing::debug!(site = site_id, tank = tank_id, "Loading stored history");
        self.send(self.client.get(&url))
            .await?
            .json::<Vec<TelemetryReading>>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn delete_older_than(&self, max_age: chrono::Duration) -> Result<u64, StoreError> {
        let url = self.table_url(&format!("rpc/{}", self.cleanup_procedure));
        let args = CleanupArgs {
            cutoff: timestamp(Utc::now() - max_age),
        };

        let removed = self
            .send(self.client.post(&url).json(&args))
            .await?
            .json::<serde_json::Value>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        // Procedures that return void come back as null
        Ok(removed.as_u64().unwrap_or(0))
    }
}
