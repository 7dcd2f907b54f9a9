// Derived tank metrics domain models
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TankStatus {
    Normal,
    Warning,
    Critical,
}

impl TankStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TankStatus::Normal => "normal",
            TankStatus::Warning => "warning",
            TankStatus::Critical => "critical",
        }
    }
}

/// The single active metrics row for one tank. Overwritten every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    /// Business-hours consumption in gallons per hour. 0 when undefined.
    pub run_rate_gph: f64,
    /// None when the tank is not depleting towards its critical height.
    pub hours_to_critical: Option<f64>,
    pub status: TankStatus,
    pub capacity_percent: f64,
    pub predicted_critical_at: Option<DateTime<Utc>>,
    pub data_quality: f64,
    pub current_volume: f64,
    pub current_height: f64,
    pub available_ullage: f64,
    pub readings_used: usize,
    pub computed_at: DateTime<Utc>,
}

impl DerivedMetrics {
    /// Metrics for a tank with no readings at all.
    pub fn empty(computed_at: DateTime<Utc>) -> Self {
        Self {
            run_rate_gph: 0.0,
            hours_to_critical: None,
            status: TankStatus::Normal,
            capacity_percent: 0.0,
            predicted_critical_at: None,
            data_quality: 0.0,
            current_volume: 0.0,
            current_height: 0.0,
            available_ullage: 0.0,
            readings_used: 0,
            computed_at,
        }
    }

    /// Hours to critical as shown on the dashboard.
    pub fn hours_to_critical_label(&self) -> String {
        match self.hours_to_critical {
            Some(hours) => format!("{:.1}", hours),
            None => "N/A".to_string(),
        }
    }
}

/// Per-tank thresholds and geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct TankConfig {
    pub critical_height_in: f64,
    pub warning_height_in: f64,
    pub max_capacity_gal: Option<f64>,
    /// Inches of product height per gallon. Estimated from the latest reading when unset.
    pub height_per_gallon: Option<f64>,
    pub max_fill_percent: f64,
}

impl Default for TankConfig {
    fn default() -> Self {
        Self {
            critical_height_in: 10.0,
            warning_height_in: 20.0,
            max_capacity_gal: None,
            height_per_gallon: None,
            max_fill_percent: 90.0,
        }
    }
}
