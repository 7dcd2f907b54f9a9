use crate::application::analytics::{AnalyticsSettings, BusinessHours};
use crate::application::sync_service::SyncSettings;
use crate::domain::metrics::TankConfig;
use anyhow::{bail, Context};
use chrono::{FixedOffset, Local, Offset};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Rest,
    Memory,
}

/// Process configuration, read from the environment (keys are the
/// lower-cased variable names, e.g. `SYNC_INTERVAL_MS` -> `sync_interval_ms`).
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    pub tank_api_url: String,
    #[serde(default)]
    pub store_url: String,
    #[serde(default)]
    pub store_service_key: String,
    #[serde(default)]
    pub store_backend: StoreBackend,
    #[serde(default = "default_cleanup_procedure")]
    pub cleanup_procedure: String,

    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_upstream_max_retries")]
    pub upstream_max_retries: u32,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,
    #[serde(default = "default_backfill_batch_size")]
    pub backfill_batch_size: usize,

    #[serde(default = "default_business_hours_start")]
    pub business_hours_start: u32,
    #[serde(default = "default_business_hours_end")]
    pub business_hours_end: u32,
    /// Offset of the sites' local time from UTC. Defaults to the host's offset.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,

    #[serde(default = "default_critical_height_in")]
    pub critical_height_in: f64,
    #[serde(default = "default_warning_height_in")]
    pub warning_height_in: f64,
    #[serde(default = "default_critical_hours")]
    pub critical_hours: f64,
    #[serde(default = "default_warning_hours")]
    pub warning_hours: f64,
    #[serde(default = "default_max_fill_percent")]
    pub max_fill_percent: f64,

    /// Address of the status endpoint. Empty disables it.
    #[serde(default = "default_status_addr")]
    pub status_addr: String,
}

/// Per-tank threshold and geometry overrides from `config/tanks`
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct TankOverride {
    pub site_id: String,
    pub tank_id: String,
    pub critical_height_in: Option<f64>,
    pub warning_height_in: Option<f64>,
    pub max_capacity_gal: Option<f64>,
    pub height_per_gallon: Option<f64>,
    pub max_fill_percent: Option<f64>,
}

impl TankOverride {
    pub fn apply(&self, base: TankConfig) -> TankConfig {
        TankConfig {
            critical_height_in: self.critical_height_in.unwrap_or(base.critical_height_in),
            warning_height_in: self.warning_height_in.unwrap_or(base.warning_height_in),
            max_capacity_gal: self.max_capacity_gal.or(base.max_capacity_gal),
            height_per_gallon: self.height_per_gallon.or(base.height_per_gallon),
            max_fill_percent: self.max_fill_percent.unwrap_or(base.max_fill_percent),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TanksFile {
    #[serde(default)]
    tanks: Vec<TankOverride>,
}

fn default_cleanup_procedure() -> String {
    "cleanup_old_tank_logs".to_string()
}
fn default_sync_interval_ms() -> u64 {
    30_000
}
fn default_cleanup_interval_ms() -> u64 {
    3_600_000
}
fn default_health_check_interval_ms() -> u64 {
    300_000
}
fn default_http_timeout_ms() -> u64 {
    15_000
}
fn default_upstream_max_retries() -> u32 {
    2
}
fn default_retention_days() -> u32 {
    5
}
fn default_lookback_hours() -> u32 {
    24
}
fn default_backfill_batch_size() -> usize {
    500
}
fn default_business_hours_start() -> u32 {
    5
}
fn default_business_hours_end() -> u32 {
    23
}
fn default_critical_height_in() -> f64 {
    10.0
}
fn default_warning_height_in() -> f64 {
    20.0
}
fn default_critical_hours() -> f64 {
    24.0
}
fn default_warning_hours() -> f64 {
    48.0
}
fn default_max_fill_percent() -> f64 {
    90.0
}
fn default_status_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl SyncConfig {
    pub fn from_config(settings: config::Config) -> anyhow::Result<Self> {
        let config: SyncConfig = settings
            .try_deserialize()
            .context("Invalid sync configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tank_api_url.trim().is_empty() {
            bail!("TANK_API_URL must be set");
        }
        if self.store_backend == StoreBackend::Rest
            && (self.store_url.trim().is_empty() || self.store_service_key.trim().is_empty())
        {
            bail!("STORE_URL and STORE_SERVICE_KEY must be set for the rest store backend");
        }
        if self.business_hours_start >= self.business_hours_end || self.business_hours_end > 24 {
            bail!(
                "Invalid business hours window {}..{}",
                self.business_hours_start,
                self.business_hours_end
            );
        }
        if self.sync_interval_ms == 0 || self.cleanup_interval_ms == 0 || self.health_check_interval_ms == 0 {
            bail!("Intervals must be greater than zero");
        }
        if let Some(minutes) = self.utc_offset_minutes {
            if fixed_offset(minutes).is_none() {
                bail!("UTC_OFFSET_MINUTES {} is outside -1439..=1439", minutes);
            }
        }
        if self.warning_height_in < self.critical_height_in {
            bail!("WARNING_HEIGHT_IN must not be below CRITICAL_HEIGHT_IN");
        }
        Ok(())
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset_minutes
            .and_then(fixed_offset)
            .unwrap_or_else(|| Local::now().offset().fix())
    }

    pub fn analytics_settings(&self) -> AnalyticsSettings {
        AnalyticsSettings {
            business_hours: BusinessHours {
                start_hour: self.business_hours_start,
                end_hour: self.business_hours_end,
            },
            utc_offset: self.utc_offset(),
            critical_hours: self.critical_hours,
            warning_hours: self.warning_hours,
        }
    }

    pub fn tank_defaults(&self) -> TankConfig {
        TankConfig {
            critical_height_in: self.critical_height_in,
            warning_height_in: self.warning_height_in,
            max_capacity_gal: None,
            height_per_gallon: None,
            max_fill_percent: self.max_fill_percent,
        }
    }

    pub fn sync_settings(&self, tank_overrides: Vec<TankOverride>) -> SyncSettings {
        SyncSettings {
            sync_interval: Duration::from_millis(self.sync_interval_ms),
            cleanup_interval: Duration::from_millis(self.cleanup_interval_ms),
            health_interval: Duration::from_millis(self.health_check_interval_ms),
            retention: chrono::Duration::days(i64::from(self.retention_days)),
            lookback_hours: self.lookback_hours.max(1),
            backfill_batch_size: self.backfill_batch_size.max(1),
            backfill_batch_pause: Duration::from_millis(250),
            analytics: self.analytics_settings(),
            tank_defaults: self.tank_defaults(),
            tank_overrides,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

fn fixed_offset(minutes: i32) -> Option<FixedOffset> {
    minutes.checked_mul(60).and_then(FixedOffset::east_opt)
}

pub fn load_sync_config() -> anyhow::Result<SyncConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/fuel-sync").required(false))
        .add_source(config::Environment::default().try_parsing(true))
        .build()?;

    SyncConfig::from_config(settings)
}

pub fn load_tank_overrides() -> anyhow::Result<Vec<TankOverride>> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/tanks").required(false))
        .build()?;

    tank_overrides_from(settings)
}

fn tank_overrides_from(settings: config::Config) -> anyhow::Result<Vec<TankOverride>> {
    let file: TanksFile = settings
        .try_deserialize()
        .context("Invalid tank overrides")?;
    Ok(file.tanks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> config::ConfigBuilder<config::builder::DefaultState> {
        config::Config::builder()
            .set_override("tank_api_url", "http://tanks.local/api")
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = base().set_override("store_backend", "memory").unwrap().build().unwrap();
        let config = SyncConfig::from_config(settings).unwrap();

        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.sync_interval_ms, 30_000);
        assert_eq!(config.cleanup_interval_ms, 3_600_000);
        assert_eq!(config.health_check_interval_ms, 300_000);
        assert_eq!(config.retention_days, 5);
        assert_eq!(config.business_hours_start, 5);
        assert_eq!(config.business_hours_end, 23);
        assert_eq!(config.critical_height_in, 10.0);
        assert_eq!(config.warning_height_in, 20.0);
        assert_eq!(config.cleanup_procedure, "cleanup_old_tank_logs");

        let sync = config.sync_settings(Vec::new());
        assert_eq!(sync.retention, chrono::Duration::days(5));
        assert_eq!(sync.sync_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_rest_backend_requires_credentials() {
        let settings = base().build().unwrap();
        assert!(SyncConfig::from_config(settings).is_err());

        let settings = base()
            .set_override("store_url", "https://store.local")
            .unwrap()
            .set_override("store_service_key", "service-key")
            .unwrap()
            .build()
            .unwrap();
        assert!(SyncConfig::from_config(settings).is_ok());
    }

    #[test]
    fn test_rejects_inverted_business_hours() {
        let settings = base()
            .set_override("store_backend", "memory")
            .unwrap()
            .set_override("business_hours_start", 22)
            .unwrap()
            .set_override("business_hours_end", 6)
            .unwrap()
            .build()
            .unwrap();
        assert!(SyncConfig::from_config(settings).is_err());
    }

    #[test]
    fn test_explicit_offset() {
        let settings = base()
            .set_override("store_backend", "memory")
            .unwrap()
            .set_override("utc_offset_minutes", -300)
            .unwrap()
            .build()
            .unwrap();
        let config = SyncConfig::from_config(settings).unwrap();
        assert_eq!(config.utc_offset().local_minus_utc(), -5 * 3600);
    }

    #[test]
    fn test_rejects_out_of_range_offset() {
        for minutes in [1440, -1440, i32::MAX, i32::MIN] {
            let settings = base()
                .set_override("store_backend", "memory")
                .unwrap()
                .set_override("utc_offset_minutes", i64::from(minutes))
                .unwrap()
                .build()
                .unwrap();
            assert!(SyncConfig::from_config(settings).is_err(), "offset {} accepted", minutes);
        }

        let settings = base()
            .set_override("store_backend", "memory")
            .unwrap()
            .set_override("utc_offset_minutes", 1439)
            .unwrap()
            .build()
            .unwrap();
        assert!(SyncConfig::from_config(settings).is_ok());
    }

    #[test]
    fn test_tank_overrides() {
        let toml = r#"
            [[tanks]]
            site_id = "1042"
            tank_id = "3"
            critical_height_in = 14.0
            max_capacity_gal = 12000.0
        "#;
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap();

        let overrides = tank_overrides_from(settings).unwrap();
        assert_eq!(overrides.len(), 1);

        let resolved = overrides[0].apply(TankConfig::default());
        assert_eq!(resolved.critical_height_in, 14.0);
        assert_eq!(resolved.warning_height_in, 20.0);
        assert_eq!(resolved.max_capacity_gal, Some(12000.0));
        assert_eq!(resolved.max_fill_percent, 90.0);
    }
}
