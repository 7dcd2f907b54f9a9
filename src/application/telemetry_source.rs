// Source trait for upstream tank telemetry
use crate::domain::error::SourceError;
use crate::domain::reading::{FleetSnapshot, TelemetryReading};
use async_trait::async_trait;

/// Sampling requested from the upstream history endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Raw,
    Hourly,
}

impl Granularity {
    /// Hourly sampling for anything longer than a day.
    pub fn for_lookback(hours: u32) -> Self {
        if hours > 24 {
            Granularity::Hourly
        } else {
            Granularity::Raw
        }
    }
}

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Fetch every site with the latest reading of each of its tanks
    async fn fetch_all_sites(&self) -> Result<FleetSnapshot, SourceError>;

    /// Fetch the readings of one tank over the last `since_hours` hours
    async fn fetch_history(
        &self,
        site_id: &str,
        tank_id: &str,
        since_hours: u32,
        granularity: Granularity,
    ) -> Result<Vec<TelemetryReading>, SourceError>;

    async fn check_connectivity(&self) -> Result<(), SourceError> {
        self.fetch_all_sites().await.map(|_| ())
    }
}
