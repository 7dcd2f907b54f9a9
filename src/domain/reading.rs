// Tank reading domain models
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TEMPERATURE_F: f64 = 70.0;

/// Identity of a reading. Two readings with the same key are the same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadingKey {
    pub site_id: String,
    pub tank_id: String,
    pub recorded_at: DateTime<Utc>,
}

/// Point-in-time tank measurement. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub site_id: String,
    pub tank_id: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub tc_volume: f64,
    #[serde(default)]
    pub ullage: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub water: f64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE_F
}

impl TelemetryReading {
    /// A reading with every measurement at its documented default.
    pub fn new(site_id: String, tank_id: String, recorded_at: DateTime<Utc>) -> Self {
        Self {
            site_id,
            tank_id,
            recorded_at,
            product: String::new(),
            volume: 0.0,
            tc_volume: 0.0,
            ullage: 0.0,
            height: 0.0,
            water: 0.0,
            temperature: DEFAULT_TEMPERATURE_F,
        }
    }

    pub fn key(&self) -> ReadingKey {
        ReadingKey {
            site_id: self.site_id.clone(),
            tank_id: self.tank_id.clone(),
            recorded_at: self.recorded_at,
        }
    }

    /// Temperature-compensated volume when the gauge reports one, raw volume otherwise.
    pub fn effective_volume(&self) -> f64 {
        if self.tc_volume > 0.0 {
            self.tc_volume
        } else {
            self.volume
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TankSnapshot {
    pub site_id: String,
    pub tank_id: String,
    pub product: String,
    /// Nominal capacity in gallons, when upstream publishes it.
    pub capacity: Option<f64>,
    pub latest: Option<TelemetryReading>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SiteSnapshot {
    pub site_id: String,
    pub site_name: String,
    pub tanks: Vec<TankSnapshot>,
    /// Tank entries discarded during normalization.
    pub dropped: usize,
}

impl SiteSnapshot {
    pub fn new(site_id: String, site_name: String) -> Self {
        Self {
            site_id,
            site_name,
            tanks: Vec::new(),
            dropped: 0,
        }
    }
}

/// Everything one `/sites` poll produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FleetSnapshot {
    pub sites: Vec<SiteSnapshot>,
    /// Site entries discarded during normalization.
    pub dropped_sites: usize,
}

impl FleetSnapshot {
    /// Dropped sites plus dropped tanks across all sites.
    pub fn malformed_records(&self) -> usize {
        self.dropped_sites + self.sites.iter().map(|site| site.dropped).sum::<usize>()
    }
}
