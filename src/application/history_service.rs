// History service - Tank history with a single degraded-data retry
use crate::application::telemetry_source::{Granularity, TelemetrySource};
use crate::domain::error::SourceError;
use crate::domain::reading::TelemetryReading;
use serde::Serialize;
use std::sync::Arc;

const MIN_READINGS: usize = 2;
const FALLBACK_HOURS: u32 = 24;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryWindow {
    Available {
        lookback_hours: u32,
        readings: Vec<TelemetryReading>,
    },
    /// Neither the requested window nor the shrunk retry produced enough readings.
    InsufficientData { attempted_hours: Vec<u32> },
}

#[derive(Clone)]
pub struct HistoryService {
    source: Arc<dyn TelemetrySource>,
}

impl HistoryService {
    pub fn new(source: Arc<dyn TelemetrySource>) -> Self {
        Self { source }
    }

    pub async fn load(
        &self,
        site_id: &str,
        tank_id: &str,
        lookback_hours: u32,
    ) -> Result<HistoryWindow, SourceError> {
        let lookback_hours = lookback_hours.max(1);
        let retry_hours = shrink(lookback_hours);

        let first = self.attempt(site_id, tank_id, lookback_hours).await;
        let first_error = match first {
            Ok(readings) if readings.len() >= MIN_READINGS => {
                return Ok(HistoryWindow::Available {
                    lookback_hours,
                    readings,
                });
            }
            Ok(readings) => {
                tracing::debug!(
                    site = site_id,
                    tank = tank_id,
                    found = readings.len(),
                    lookback_hours,
                    retry_hours,
                    "Not enough history, retrying with a shorter window"
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    site = site_id,
                    tank = tank_id,
                    lookback_hours,
                    retry_hours,
                    "History fetch failed, retrying with a shorter window: {}",
                    e
                );
                Some(e)
            }
        };

        match self.attempt(site_id, tank_id, retry_hours).await {
            Ok(readings) if readings.len() >= MIN_READINGS => Ok(HistoryWindow::Available {
                lookback_hours: retry_hours,
                readings,
            }),
            Ok(_) => Ok(HistoryWindow::InsufficientData {
                attempted_hours: vec![lookback_hours, retry_hours],
            }),
            Err(e) if first_error.is_some() => Err(e),
            Err(e) => {
                tracing::warn!(site = site_id, tank = tank_id, "History retry failed: {}", e);
                Ok(HistoryWindow::InsufficientData {
                    attempted_hours: vec![lookback_hours, retry_hours],
                })
            }
        }
    }

    async fn attempt(
        &self,
        site_id: &str,
        tank_id: &str,
        hours: u32,
    ) -> Result<Vec<TelemetryReading>, SourceError> {
        let mut readings = self
            .source
            .fetch_history(site_id, tank_id, hours, Granularity::for_lookback(hours))
            .await?;
        readings.sort_by_key(|r| r.recorded_at);
        Ok(readings)
    }
}

/// Window used for the single retry: a day of raw readings, or half of a short window.
fn shrink(lookback_hours: u32) -> u32 {
    if lookback_hours > FALLBACK_HOURS {
        FALLBACK_HOURS
    } else {
        (lookback_hours / 2).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::reading::FleetSnapshot;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::Mutex;

    /// Serves a fixed number of readings for windows up to `max_hours`, and
    /// fails for longer windows when `fail_long` is set.
    struct ScriptedSource {
        max_hours: u32,
        readings_per_call: usize,
        fail_long: bool,
        calls: Mutex<Vec<(u32, Granularity)>>,
    }

    impl ScriptedSource {
        fn new(max_hours: u32, readings_per_call: usize, fail_long: bool) -> Self {
            Self {
                max_hours,
                readings_per_call,
                fail_long,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TelemetrySource for ScriptedSource {
        async fn fetch_all_sites(&self) -> Result<FleetSnapshot, SourceError> {
            Ok(FleetSnapshot::default())
        }

        async fn fetch_history(
            &self,
            site_id: &str,
            tank_id: &str,
            since_hours: u32,
            granularity: Granularity,
        ) -> Result<Vec<TelemetryReading>, SourceError> {
            self.calls.lock().unwrap().push((since_hours, granularity));
            if since_hours > self.max_hours {
                if self.fail_long {
                    return Err(SourceError::Unavailable("timeout".to_string()));
                }
                return Ok(Vec::new());
            }
            let now = Utc::now();
            Ok((0..self.readings_per_call)
                .rev()
                .map(|i| {
                    TelemetryReading::new(
                        site_id.to_string(),
                        tank_id.to_string(),
                        now - Duration::hours(i as i64),
                    )
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_first_window_succeeds() {
        let source = Arc::new(ScriptedSource::new(500, 5, false));
        let service = HistoryService::new(source.clone());

        let window = service.load("s1", "1", 120).await.unwrap();
        match window {
            HistoryWindow::Available {
                lookback_hours,
                readings,
            } => {
                assert_eq!(lookback_hours, 120);
                assert_eq!(readings.len(), 5);
                assert!(readings.windows(2).all(|w| w[0].recorded_at <= w[1].recorded_at));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(*source.calls.lock().unwrap(), vec![(120, Granularity::Hourly)]);
    }

    #[tokio::test]
    async fn test_retries_once_with_shorter_window() {
        let source = Arc::new(ScriptedSource::new(24, 3, true));
        let service = HistoryService::new(source.clone());

        let window = service.load("s1", "1", 120).await.unwrap();
        assert!(matches!(
            window,
            HistoryWindow::Available {
                lookback_hours: 24,
                ..
            }
        ));
        assert_eq!(
            *source.calls.lock().unwrap(),
            vec![(120, Granularity::Hourly), (24, Granularity::Raw)]
        );
    }

    #[tokio::test]
    async fn test_insufficient_data_is_explicit() {
        let source = Arc::new(ScriptedSource::new(500, 1, false));
        let service = HistoryService::new(source.clone());

        let window = service.load("s1", "1", 12).await.unwrap();
        match window {
            HistoryWindow::InsufficientData { attempted_hours } => {
                assert_eq!(attempted_hours, vec![12, 6]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(source.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_both_attempts_failing_propagates() {
        let source = Arc::new(ScriptedSource::new(0, 3, true));
        let service = HistoryService::new(source);

        let result = service.load("s1", "1", 48).await;
        assert!(matches!(result, Err(SourceError::Unavailable(_))));
    }

    #[test]
    fn test_shrink() {
        assert_eq!(shrink(120), 24);
        assert_eq!(shrink(24), 12);
        assert_eq!(shrink(1), 1);
    }
}
