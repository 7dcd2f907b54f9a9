// Sync orchestrator - Periodic ingestion, analytics and retention cleanup
use crate::application::analytics::{derive_metrics, AnalyticsSettings};
use crate::application::retention_store::{RetentionStore, UpsertOutcome};
use crate::application::telemetry_source::{Granularity, TelemetrySource};
use crate::domain::error::{StoreError, SyncError};
use crate::domain::metrics::{DerivedMetrics, TankConfig};
use crate::domain::reading::{FleetSnapshot, TankSnapshot};
use crate::domain::stats::SyncCycleStats;
use crate::infrastructure::config::TankOverride;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const BACKFILL_CONCURRENCY: usize = 2;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub sync_interval: Duration,
    pub cleanup_interval: Duration,
    pub health_interval: Duration,
    pub retention: chrono::Duration,
    /// Window of stored history fed to the analytics engine
    pub lookback_hours: u32,
    pub backfill_batch_size: usize,
    pub backfill_batch_pause: Duration,
    pub analytics: AnalyticsSettings,
    pub tank_defaults: TankConfig,
    pub tank_overrides: Vec<TankOverride>,
}

impl SyncSettings {
    /// Defaults, then upstream capacity, then the per-tank override.
    pub fn tank_config(&self, tank: &TankSnapshot) -> TankConfig {
        let mut config = self.tank_defaults.clone();
        if tank.capacity.is_some() {
            config.max_capacity_gal = tank.capacity;
        }
        match self
            .tank_overrides
            .iter()
            .find(|o| o.site_id == tank.site_id && o.tank_id == tank.tank_id)
        {
            Some(over) => over.apply(config),
            None => config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Success { tanks: usize },
    Partial { succeeded: usize, failed: usize },
    Failed { reason: String },
    /// A previous cycle was still running
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    pub tanks: usize,
    pub failed_tanks: usize,
    pub readings_fetched: usize,
    pub readings_inserted: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub uptime_seconds: i64,
    pub cycle_running: bool,
    #[serde(flatten)]
    pub stats: SyncCycleStats,
}

#[derive(Debug, Default)]
struct CycleTally {
    succeeded: usize,
    failed: usize,
    inserted: u64,
    duplicates: u64,
    malformed: u64,
    errors: Vec<String>,
}

/// Clears the in-flight flag when the cycle ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncOrchestrator {
    source: Arc<dyn TelemetrySource>,
    store: Arc<dyn RetentionStore>,
    settings: SyncSettings,
    stats: RwLock<SyncCycleStats>,
    in_flight: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        store: Arc<dyn RetentionStore>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            source,
            store,
            settings,
            stats: RwLock::new(SyncCycleStats::new(Utc::now())),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Verify both data paths before entering the loop.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.store
            .test_connectivity()
            .await
            .map_err(|e| SyncError::StartupConnectivity(format!("retention store: {}", e)))?;
        self.source
            .check_connectivity()
            .await
            .map_err(|e| SyncError::StartupConnectivity(format!("telemetry source: {}", e)))?;

        tracing::info!("Retention store and telemetry source reachable");
        Ok(())
    }

    pub fn is_cycle_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub async fn stats(&self) -> SyncCycleStats {
        self.stats.read().await.clone()
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            self.record_skip().await;
            return CycleOutcome::Skipped;
        };

        let started = Instant::now();
        let (outcome, tally) = match self.source.fetch_all_sites().await {
            Ok(fleet) => {
                let tally = self.process_fleet(&fleet).await;
                let outcome = if tally.failed == 0 {
                    CycleOutcome::Success {
                        tanks: tally.succeeded,
                    }
                } else {
                    CycleOutcome::Partial {
                        succeeded: tally.succeeded,
                        failed: tally.failed,
                    }
                };
                (outcome, tally)
            }
            Err(e) => {
                let error = SyncError::from(e);
                tracing::error!("Sync cycle failed: {}", error);
                let tally = CycleTally {
                    errors: vec![error.to_string()],
                    ..CycleTally::default()
                };
                (
                    CycleOutcome::Failed {
                        reason: error.to_string(),
                    },
                    tally,
                )
            }
        };

        let mut stats = self.stats.write().await;
        stats.cycle_count += 1;
        stats.readings_inserted += tally.inserted;
        stats.duplicate_readings += tally.duplicates;
        stats.failed_tanks += tally.failed as u64;
        stats.malformed_records += tally.malformed;
        for error in tally.errors {
            stats.record_error(error);
        }
        if tally.succeeded > 0 || matches!(outcome, CycleOutcome::Success { .. }) {
            stats.last_success = Some(Utc::now());
        }

        tracing::info!(
            cycle = stats.cycle_count,
            succeeded = tally.succeeded,
            failed = tally.failed,
            inserted = tally.inserted,
            duplicates = tally.duplicates,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sync cycle finished"
        );

        outcome
    }

    async fn record_skip(&self) {
        self.stats.write().await.skipped_cycles += 1;
        tracing::warn!("Previous sync cycle still running, skipping this interval");
    }

    async fn process_fleet(&self, fleet: &FleetSnapshot) -> CycleTally {
        let mut tally = CycleTally {
            malformed: fleet.malformed_records() as u64,
            ..CycleTally::default()
        };
        let now = Utc::now();

        for site in &fleet.sites {
            for tank in &site.tanks {
                if tank.latest.is_none() {
                    tracing::debug!(site = %tank.site_id, tank = %tank.tank_id, "Tank has no latest reading");
                    continue;
                }
                match self.sync_tank(tank, now).await {
                    Ok(UpsertOutcome::Inserted) => {
                        tally.succeeded += 1;
                        tally.inserted += 1;
                    }
                    Ok(UpsertOutcome::Duplicate) => {
                        tally.succeeded += 1;
                        tally.duplicates += 1;
                    }
                    Err(e) => {
                        tracing::error!(site = %tank.site_id, tank = %tank.tank_id, "{}", e);
                        tally.failed += 1;
                        tally.errors.push(e.to_string());
                    }
                }
            }
        }

        tally
    }

    /// Persist the tank's latest reading, then recompute its metrics from stored history.
    async fn sync_tank(&self, tank: &TankSnapshot, now: DateTime<Utc>) -> Result<UpsertOutcome, SyncError> {
        let Some(reading) = tank.latest.as_ref() else {
            return Ok(UpsertOutcome::Duplicate);
        };

        let outcome = self
            .store
            .upsert_reading(reading)
            .await
            .map_err(|e| SyncError::persistence(&tank.site_id, &tank.tank_id, e))?;

        self.refresh_metrics(tank, now)
            .await
            .map_err(|e| SyncError::persistence(&tank.site_id, &tank.tank_id, e))?;

        Ok(outcome)
    }

    async fn refresh_metrics(&self, tank: &TankSnapshot, now: DateTime<Utc>) -> Result<DerivedMetrics, StoreError> {
        let since = now - chrono::Duration::hours(i64::from(self.settings.lookback_hours));
        let history = self
            .store
            .readings_since(&tank.site_id, &tank.tank_id, since)
            .await?;

        let config = self.settings.tank_config(tank);
        let metrics = derive_metrics(&history, &config, &self.settings.analytics, now);
        self.store
            .upsert_derived_metrics(&tank.site_id, &tank.tank_id, &metrics)
            .await?;

        tracing::debug!(
            site = %tank.site_id,
            tank = %tank.tank_id,
            run_rate = metrics.run_rate_gph,
            hours_to_critical = %metrics.hours_to_critical_label(),
            status = metrics.status.as_str(),
            "Metrics updated"
        );
        Ok(metrics)
    }

    pub async fn run_cleanup(&self) -> Result<u64, StoreError> {
        match self.store.delete_older_than(self.settings.retention).await {
            Ok(removed) => {
                let mut stats = self.stats.write().await;
                stats.cleanup_runs += 1;
                stats.readings_expired += removed;
                tracing::info!(
                    removed,
                    retention_days = self.settings.retention.num_days(),
                    "Retention cleanup finished"
                );
                Ok(removed)
            }
            Err(e) => {
                tracing::error!("Retention cleanup failed: {}", e);
                self.stats
                    .write()
                    .await
                    .record_error(format!("Cleanup failed: {}", e));
                Err(e)
            }
        }
    }

    pub async fn health_report(&self) -> HealthReport {
        let stats = self.stats().await;
        HealthReport {
            uptime_seconds: stats.uptime(Utc::now()).num_seconds(),
            cycle_running: self.is_cycle_running(),
            stats,
        }
    }

    async fn log_health(&self) {
        let report = self.health_report().await;
        tracing::info!(
            uptime_seconds = report.uptime_seconds,
            cycles = report.stats.cycle_count,
            skipped = report.stats.skipped_cycles,
            last_success = ?report.stats.last_success,
            recent_errors = report.stats.recent_errors.len(),
            readings_inserted = report.stats.readings_inserted,
            failed_tanks = report.stats.failed_tanks,
            "Sync health"
        );
        if let Some(last) = report.stats.recent_errors.back() {
            tracing::info!(at = %last.at, "Most recent error: {}", last.message);
        }
    }

    /// One-shot import of `days` of history for every tank.
    pub async fn backfill(&self, days: u32) -> Result<BackfillSummary, SyncError> {
        let hours = days.max(1).saturating_mul(24);
        let fleet = self.source.fetch_all_sites().await?;
        let tanks: Vec<TankSnapshot> = fleet.sites.into_iter().flat_map(|site| site.tanks).collect();

        tracing::info!(tanks = tanks.len(), days, "Starting history backfill");

        let results: Vec<Result<BackfillSummary, SyncError>> = futures::stream::iter(tanks.iter())
            .map(|tank| self.backfill_tank(tank, hours))
            .buffer_unordered(BACKFILL_CONCURRENCY)
            .collect()
            .await;

        let mut summary = BackfillSummary {
            tanks: tanks.len(),
            ..BackfillSummary::default()
        };
        let mut stats = self.stats.write().await;
        for result in results {
            match result {
                Ok(tank) => {
                    summary.readings_fetched += tank.readings_fetched;
                    summary.readings_inserted += tank.readings_inserted;
                    summary.batches += tank.batches;
                }
                Err(e) => {
                    tracing::error!("Backfill failed: {}", e);
                    summary.failed_tanks += 1;
                    stats.record_error(e.to_string());
                }
            }
        }
        stats.readings_inserted += summary.readings_inserted as u64;

        tracing::info!(
            tanks = summary.tanks,
            failed = summary.failed_tanks,
            fetched = summary.readings_fetched,
            inserted = summary.readings_inserted,
            batches = summary.batches,
            "History backfill finished"
        );
        Ok(summary)
    }

    async fn backfill_tank(&self, tank: &TankSnapshot, hours: u32) -> Result<BackfillSummary, SyncError> {
        let readings = self
            .source
            .fetch_history(&tank.site_id, &tank.tank_id, hours, Granularity::Hourly)
            .await?;

        let mut summary = BackfillSummary {
            tanks: 1,
            readings_fetched: readings.len(),
            ..BackfillSummary::default()
        };
        if readings.is_empty() {
            return Ok(summary);
        }

        let batch_size = self.settings.backfill_batch_size.max(1);
        for (index, batch) in readings.chunks(batch_size).enumerate() {
            if index > 0 && !self.settings.backfill_batch_pause.is_zero() {
                tokio::time::sleep(self.settings.backfill_batch_pause).await;
            }
            summary.readings_inserted += self
                .store
                .upsert_readings(batch)
                .await
                .map_err(|e| SyncError::persistence(&tank.site_id, &tank.tank_id, e))?;
            summary.batches += 1;
        }

        self.refresh_metrics(tank, Utc::now())
            .await
            .map_err(|e| SyncError::persistence(&tank.site_id, &tank.tank_id, e))?;

        tracing::debug!(
            site = %tank.site_id,
            tank = %tank.tank_id,
            fetched = summary.readings_fetched,
            inserted = summary.readings_inserted,
            "Tank backfilled"
        );
        Ok(summary)
    }

    /// Drive the sync, cleanup and health timers until `shutdown` resolves.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let (stop_tx, stop_rx) = watch::channel(false);

        let sync = tokio::spawn(self.clone().sync_loop(stop_rx.clone()));
        let cleanup = tokio::spawn(self.clone().cleanup_loop(stop_rx.clone()));
        let health = tokio::spawn(self.clone().health_loop(stop_rx));

        tracing::info!(
            sync_interval_ms = self.settings.sync_interval.as_millis() as u64,
            cleanup_interval_ms = self.settings.cleanup_interval.as_millis() as u64,
            health_interval_ms = self.settings.health_interval.as_millis() as u64,
            "Sync orchestrator running"
        );

        shutdown.await;
        tracing::info!("Shutdown requested, waiting for in-flight work");
        let _ = stop_tx.send(true);
        let _ = tokio::join!(sync, cleanup, health);

        let report = self.health_report().await;
        tracing::info!(
            uptime_seconds = report.uptime_seconds,
            cycles = report.stats.cycle_count,
            skipped = report.stats.skipped_cycles,
            readings_inserted = report.stats.readings_inserted,
            failed_tanks = report.stats.failed_tanks,
            readings_expired = report.stats.readings_expired,
            "Final sync statistics"
        );
    }

    async fn sync_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut current: Option<JoinHandle<CycleOutcome>> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_cycle_running() {
                        self.record_skip().await;
                        continue;
                    }
                    let orchestrator = self.clone();
                    current = Some(tokio::spawn(async move { orchestrator.run_cycle().await }));
                }
                _ = stop.changed() => break,
            }
        }

        if let Some(handle) = current {
            if let Err(e) = handle.await {
                tracing::error!("Sync cycle task ended abnormally: {}", e);
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.run_cleanup().await;
                }
                _ = stop.changed() => break,
            }
        }
    }

    async fn health_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let period = self.settings.health_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.log_health().await,
                _ = stop.changed() => break,
            }
        }
    }
}
