// HTTP telemetry source - Fetches and normalizes upstream tank snapshots
use crate::application::telemetry_source::{Granularity, TelemetrySource};
use crate::domain::error::{MalformedRecord, SourceError};
use crate::domain::reading::{FleetSnapshot, SiteSnapshot, TankSnapshot, TelemetryReading, DEFAULT_TEMPERATURE_F};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpTelemetrySource {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
    retry_delay: Duration,
}

#[derive(Debug, Deserialize)]
struct RawSite {
    #[serde(default, alias = "id")]
    site_id: Option<Value>,
    #[serde(default, alias = "name")]
    site_name: Option<String>,
    #[serde(default)]
    tanks: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawTank {
    #[serde(default, alias = "tank_number", alias = "id")]
    tank_id: Option<Value>,
    #[serde(default, alias = "product_name")]
    product: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    capacity: Option<f64>,
    #[serde(default)]
    latest_log: Option<RawLog>,
}

#[derive(Debug, Deserialize)]
struct RawLog {
    #[serde(default, deserialize_with = "lenient_f64")]
    volume: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    tc_volume: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    ullage: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    height: Option<f64>,
    #[serde(default, alias = "water_level", deserialize_with = "lenient_f64")]
    water: Option<f64>,
    #[serde(default, alias = "temp", deserialize_with = "lenient_f64")]
    temperature: Option<f64>,
    #[serde(default, alias = "log_time", alias = "recorded_at")]
    timestamp: Option<String>,
    #[serde(default, alias = "product_name")]
    product: Option<String>,
}

/// Accepts JSON numbers and numeric strings; null, absent and blank become None.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("not a number: {:?}", s))),
        Some(other) => Err(de::Error::custom(format!("not a number: {}", other))),
    }
}

fn identifier(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS[.fff]` taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn normalize_log(
    site_id: &str,
    tank_id: &str,
    product: &str,
    log: RawLog,
    ingested_at: DateTime<Utc>,
) -> Result<TelemetryReading, MalformedRecord> {
    let recorded_at = match log.timestamp.as_deref() {
        None => ingested_at,
        Some(raw) if raw.trim().is_empty() => ingested_at,
        Some(raw) => parse_timestamp(raw).ok_or_else(|| MalformedRecord {
            site_id: site_id.to_string(),
            reason: format!("tank {}: unparsable timestamp {:?}", tank_id, raw),
        })?,
    };

    Ok(TelemetryReading {
        site_id: site_id.to_string(),
        tank_id: tank_id.to_string(),
        recorded_at,
        product: log.product.unwrap_or_else(|| product.to_string()),
        volume: log.volume.unwrap_or(0.0),
        tc_volume: log.tc_volume.unwrap_or(0.0),
        ullage: log.ullage.unwrap_or(0.0),
        height: log.height.unwrap_or(0.0),
        water: log.water.unwrap_or(0.0),
        temperature: log.temperature.unwrap_or(DEFAULT_TEMPERATURE_F),
    })
}

fn normalize_tank(
    site_id: &str,
    raw: Value,
    ingested_at: DateTime<Utc>,
) -> Result<TankSnapshot, MalformedRecord> {
    let malformed = |reason: String| MalformedRecord {
        site_id: site_id.to_string(),
        reason,
    };

    let tank: RawTank = serde_json::from_value(raw).map_err(|e| malformed(e.to_string()))?;
    let tank_id = identifier(tank.tank_id.as_ref()).ok_or_else(|| malformed("missing tank id".to_string()))?;
    let product = tank.product.unwrap_or_default();

    let latest = tank
        .latest_log
        .map(|log| normalize_log(site_id, &tank_id, &product, log, ingested_at))
        .transpose()?;

    Ok(TankSnapshot {
        site_id: site_id.to_string(),
        tank_id,
        product,
        capacity: tank.capacity.filter(|c| *c > 0.0),
        latest,
    })
}

/// Normalize the `/sites` payload. Malformed sites and tanks are dropped and counted.
pub fn normalize_sites(payload: Value, ingested_at: DateTime<Utc>) -> Result<FleetSnapshot, SourceError> {
    let Value::Array(entries) = payload else {
        return Err(SourceError::Decode("expected a JSON array of sites".to_string()));
    };

    let mut fleet = FleetSnapshot {
        sites: Vec::with_capacity(entries.len()),
        dropped_sites: 0,
    };
    for entry in entries {
        let raw: RawSite = match serde_json::from_value(entry) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Dropping malformed site entry: {}", e);
                fleet.dropped_sites += 1;
                continue;
            }
        };
        let Some(site_id) = identifier(raw.site_id.as_ref()) else {
            tracing::warn!("Dropping site entry without an id");
            fleet.dropped_sites += 1;
            continue;
        };

        let mut site = SiteSnapshot::new(site_id.clone(), raw.site_name.unwrap_or_else(|| site_id.clone()));
        for tank in raw.tanks {
            match normalize_tank(&site_id, tank, ingested_at) {
                Ok(tank) => site.tanks.push(tank),
                Err(e) => {
                    tracing::warn!(site = %site_id, "{}", e);
                    site.dropped += 1;
                }
            }
        }
        fleet.sites.push(site);
    }

    Ok(fleet)
}

/// Normalize a tank history payload, dropping malformed entries.
pub fn normalize_history(
    site_id: &str,
    tank_id: &str,
    payload: Value,
    ingested_at: DateTime<Utc>,
) -> Result<Vec<TelemetryReading>, SourceError> {
    let Value::Array(entries) = payload else {
        return Err(SourceError::Decode("expected a JSON array of tank logs".to_string()));
    };

    let mut readings = Vec::with_capacity(entries.len());
    let mut dropped = 0usize;
    for entry in entries {
        let normalized = serde_json::from_value::<RawLog>(entry)
            .map_err(|e| MalformedRecord {
                site_id: site_id.to_string(),
                reason: format!("tank {}: {}", tank_id, e),
            })
            .and_then(|log| normalize_log(site_id, tank_id, "", log, ingested_at));
        match normalized {
            Ok(reading) => readings.push(reading),
            Err(e) => {
                tracing::debug!("{}", e);
                dropped += 1;
            }
        }
    }

    if dropped > 0 {
        tracing::warn!(site = site_id, tank = tank_id, dropped, "Dropped malformed history entries");
    }
    Ok(readings)
}

/// Exponential backoff: `initial * 2^attempt`, capped at `max`.
fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt);
    initial.saturating_mul(multiplier).min(max)
}

impl HttpTelemetrySource {
    pub fn new(base_url: String, timeout: Duration, max_retries: u32) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries,
            retry_delay: Duration::from_millis(500),
        })
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    fn history_url(&self, site_id: &str, tank_id: &str, since_hours: u32, granularity: Granularity) -> String {
        let mut url = format!(
            "{}/sites/{}/tanks/{}/logs?hours={}",
            self.base_url,
            urlencoding::encode(site_id),
            urlencoding::encode(tank_id),
            since_hours
        );
        if granularity == Granularity::Hourly {
            url.push_str("&granularity=hourly");
        }
        url
    }

    async fn get_json_once(&self, url: &str) -> Result<Value, SourceError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(format!("request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Unavailable(format!(
                "{} returned status {}: {}",
                url, status, body
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))
    }

    async fn get_json(&self, url: &str) -> Result<Value, SourceError> {
        let mut attempt = 0;
        loop {
            match self.get_json_once(url).await {
                Err(SourceError::Unavailable(message)) if attempt < self.max_retries => {
                    let delay = backoff_delay(attempt, self.retry_delay, MAX_RETRY_DELAY);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Upstream request failed, retrying: {}",
                        message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetrySource {
    async fn fetch_all_sites(&self) -> Result<FleetSnapshot, SourceError> {
        let url = format!("{}/sites", self.base_url);
        let payload = self.get_json(&url).await?;
        let fleet = normalize_sites(payload, Utc::now())?;

        tracing::debug!(
            sites = fleet.sites.len(),
            tanks = fleet.sites.iter().map(|s| s.tanks.len()).sum::<usize>(),
            malformed = fleet.malformed_records(),
            "Fetched site snapshots"
        );
        Ok(fleet)
    }

    async fn fetch_history(
        &self,
        site_id: &str,
        tank_id: &str,
        since_hours: u32,
        granularity: Granularity,
    ) -> Result<Vec<TelemetryReading>, SourceError> {
        let url = self.history_url(site_id, tank_id, since_hours, granularity);
        let payload = self.get_json(&url).await?;
        normalize_history(site_id, tank_id, payload, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::test_server::serve;
    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sites_payload() -> Value {
        json!([
            {
                "site_id": "1042",
                "site_name": "Main St",
                "tanks": [
                    {
                        "tank_id": "1",
                        "product": "Regular",
                        "capacity": 12000,
                        "latest_log": {
                            "volume": 5400.5,
                            "tc_volume": 5388.1,
                            "ullage": 6599.5,
                            "height": 48.25,
                            "water": 0.4,
                            "temperature": 62.3,
                            "timestamp": "2026-03-02T14:05:00Z"
                        }
                    },
                    {
                        "tank_number": 2,
                        "product_name": "Diesel",
                        "latest_log": { "volume": "3100", "height": null, "temp": "" }
                    },
                    {
                        "tank_id": "3",
                        "latest_log": { "volume": "n/a", "timestamp": "2026-03-02T14:05:00Z" }
                    },
                    { "tank_id": "4", "product": "Premium" }
                ]
            },
            { "id": 77, "tanks": [] },
            { "site_name": "No id" }
        ])
    }

    #[test]
    fn test_normalize_sites_applies_defaults_and_drops_malformed() {
        let ingested_at = Utc.with_ymd_and_hms(2026, 3, 2, 14, 6, 0).unwrap();
        let fleet = normalize_sites(sites_payload(), ingested_at).unwrap();
        assert_eq!(fleet.dropped_sites, 1);
        assert_eq!(fleet.malformed_records(), 2);

        let sites = &fleet.sites;
        assert_eq!(sites.len(), 2);
        let main = &sites[0];
        assert_eq!(main.site_name, "Main St");
        assert_eq!(main.tanks.len(), 3);
        assert_eq!(main.dropped, 1);

        let regular = main.tanks[0].latest.as_ref().unwrap();
        assert_eq!(regular.tc_volume, 5388.1);
        assert_eq!(regular.temperature, 62.3);
        assert_eq!(regular.product, "Regular");
        assert_eq!(regular.recorded_at, Utc.with_ymd_and_hms(2026, 3, 2, 14, 5, 0).unwrap());
        assert_eq!(main.tanks[0].capacity, Some(12000.0));

        let diesel = &main.tanks[1];
        assert_eq!(diesel.tank_id, "2");
        let diesel_log = diesel.latest.as_ref().unwrap();
        assert_eq!(diesel_log.volume, 3100.0);
        assert_eq!(diesel_log.tc_volume, 0.0);
        assert_eq!(diesel_log.height, 0.0);
        assert_eq!(diesel_log.temperature, 70.0);
        assert_eq!(diesel_log.recorded_at, ingested_at);
        assert_eq!(diesel_log.product, "Diesel");

        assert_eq!(main.tanks[2].tank_id, "4");
        assert!(main.tanks[2].latest.is_none());

        assert_eq!(sites[1].site_id, "77");
        assert_eq!(sites[1].site_name, "77");
    }

    #[test]
    fn test_non_array_payload_is_a_decode_error() {
        let result = normalize_sites(json!({ "error": "maintenance" }), Utc::now());
        assert!(matches!(result, Err(SourceError::Decode(_))));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2026-03-02T09:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2026-03-02T04:30:00-05:00"), Some(expected));
        assert_eq!(parse_timestamp("2026-03-02 09:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2026-03-02T09:30:00.000"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let initial = Duration::from_millis(500);
        assert_eq!(backoff_delay(0, initial, MAX_RETRY_DELAY), Duration::from_millis(500));
        assert_eq!(backoff_delay(2, initial, MAX_RETRY_DELAY), Duration::from_secs(2));
        assert_eq!(backoff_delay(10, initial, MAX_RETRY_DELAY), MAX_RETRY_DELAY);
    }

    async fn sites_handler(State(failures): State<Arc<AtomicUsize>>) -> (StatusCode, Json<Value>) {
        let remaining = failures.load(Ordering::SeqCst);
        if remaining > 0 {
            failures.store(remaining - 1, Ordering::SeqCst);
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "boom" })));
        }
        (StatusCode::OK, Json(sites_payload()))
    }

    async fn logs_handler(
        Path((site, tank)): Path<(String, String)>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        assert_eq!(site, "1042");
        assert_eq!(tank, "1");
        let hourly = params.get("granularity").map(String::as_str) == Some("hourly");
        let hours: i64 = params.get("hours").and_then(|h| h.parse().ok()).unwrap_or(0);
        let last_timestamp = if hourly { "2026-03-02T10:00:00Z" } else { "bad" };
        Json(json!([
            { "volume": 900, "timestamp": "2026-03-02T08:00:00Z" },
            { "volume": 880, "timestamp": "2026-03-02T09:00:00Z", "temperature": hours },
            { "volume": 860, "timestamp": last_timestamp },
            { "volume": {} }
        ]))
    }

    async fn start(failures: usize, max_retries: u32) -> HttpTelemetrySource {
        let router = Router::new()
            .route("/sites", get(sites_handler))
            .route("/sites/:site/tanks/:tank/logs", get(logs_handler))
            .with_state(Arc::new(AtomicUsize::new(failures)));
        let url = serve(router).await;
        HttpTelemetrySource::new(url, Duration::from_secs(5), max_retries)
            .unwrap()
            .with_retry_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_fetch_all_sites() {
        let source = start(0, 0).await;
        let fleet = source.fetch_all_sites().await.unwrap();
        assert_eq!(fleet.sites.len(), 2);
        assert_eq!(fleet.sites[0].tanks.len(), 3);
        assert_eq!(fleet.dropped_sites, 1);
    }

    #[tokio::test]
    async fn test_server_error_is_source_unavailable() {
        let source = start(1, 0).await;
        match source.fetch_all_sites().await {
            Err(SourceError::Unavailable(message)) => assert!(message.contains("500")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let source = start(2, 2).await;
        let fleet = source.fetch_all_sites().await.unwrap();
        assert_eq!(fleet.sites.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_upstream() {
        let source = HttpTelemetrySource::new("http://127.0.0.1:1".to_string(), Duration::from_secs(2), 0).unwrap();
        assert!(matches!(source.check_connectivity().await, Err(SourceError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_fetch_history_passes_window_and_granularity() {
        let source = start(0, 0).await;

        let hourly = source.fetch_history("1042", "1", 120, Granularity::Hourly).await.unwrap();
        assert_eq!(hourly.len(), 3);
        assert_eq!(hourly[1].temperature, 120.0);
        assert!(hourly.iter().all(|r| r.site_id == "1042" && r.tank_id == "1"));

        let raw = source.fetch_history("1042", "1", 12, Granularity::Raw).await.unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[1].temperature, 12.0);
    }
}
