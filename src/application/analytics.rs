// Analytics engine - Run rate, depletion projection and status classification
//
// Everything here is a pure function of a reading history. Missing or thin
// data never fails: derivations degrade to "undefined" with a lower quality score.
use crate::domain::metrics::{DerivedMetrics, TankConfig, TankStatus};
use crate::domain::reading::TelemetryReading;
use chrono::{DateTime, Days, FixedOffset, NaiveDate, Offset, Timelike, Utc};

/// Daily window, in local hours, during which consumption is measured.
/// `start_hour` is inclusive, `end_hour` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: 5,
            end_hour: 23,
        }
    }
}

impl BusinessHours {
    pub fn contains(&self, at: DateTime<Utc>, offset: &FixedOffset) -> bool {
        let hour = at.with_timezone(offset).hour();
        hour >= self.start_hour && hour < self.end_hour
    }

    fn window_on(&self, day: NaiveDate, offset: &FixedOffset) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let open = day.and_hms_opt(self.start_hour, 0, 0)?;
        let close = if self.end_hour >= 24 {
            day.checked_add_days(Days::new(1))?.and_hms_opt(0, 0, 0)?
        } else {
            day.and_hms_opt(self.end_hour, 0, 0)?
        };
        let open = open.and_local_timezone(*offset).single()?;
        let close = close.and_local_timezone(*offset).single()?;
        Some((open.with_timezone(&Utc), close.with_timezone(&Utc)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsSettings {
    pub business_hours: BusinessHours,
    pub utc_offset: FixedOffset,
    /// Projected hours below which a tank is critical
    pub critical_hours: f64,
    /// Projected hours below which a tank is in warning
    pub warning_hours: f64,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            business_hours: BusinessHours::default(),
            utc_offset: Utc.fix(),
            critical_hours: 24.0,
            warning_hours: 48.0,
        }
    }
}

const FULL_QUALITY: f64 = 1.0;
const DEGRADED_QUALITY: f64 = 0.5;

pub fn derive_metrics(
    history: &[TelemetryReading],
    tank: &TankConfig,
    settings: &AnalyticsSettings,
    now: DateTime<Utc>,
) -> DerivedMetrics {
    let Some(current) = history.iter().max_by_key(|r| r.recorded_at) else {
        return DerivedMetrics::empty(now);
    };

    let mut qualifying: Vec<&TelemetryReading> = history
        .iter()
        .filter(|r| settings.business_hours.contains(r.recorded_at, &settings.utc_offset))
        .collect();
    qualifying.sort_by_key(|r| r.recorded_at);

    let run_rate = run_rate(&qualifying, settings);
    let current_volume = current.effective_volume();

    let height_per_gallon = tank
        .height_per_gallon
        .filter(|ratio| *ratio > 0.0)
        .or_else(|| estimate_height_per_gallon(current));

    let (hours_to_critical, predicted_critical_at) = match (run_rate, height_per_gallon) {
        (Some(rate), Some(ratio)) => {
            project_critical(current.height, tank.critical_height_in, rate, ratio, now).unzip()
        }
        _ => (None, None),
    };

    let capacity = tank
        .max_capacity_gal
        .filter(|c| *c > 0.0)
        .or_else(|| Some(current.volume + current.ullage).filter(|c| *c > 0.0));

    let capacity_percent = capacity
        .map(|c| capacity_percent(current_volume, c))
        .unwrap_or(0.0);
    let available = capacity
        .map(|c| available_ullage(c, tank.max_fill_percent, current_volume))
        .unwrap_or(0.0);

    let status = classify_status(current.height, hours_to_critical, tank, settings);
    let data_quality = if run_rate.is_some() {
        FULL_QUALITY
    } else {
        DEGRADED_QUALITY
    };

    DerivedMetrics {
        run_rate_gph: run_rate.unwrap_or(0.0),
        hours_to_critical,
        status,
        capacity_percent,
        predicted_critical_at,
        data_quality,
        current_volume,
        current_height: current.height,
        available_ullage: available,
        readings_used: qualifying.len(),
        computed_at: now,
    }
}

/// Gallons per hour between the earliest and latest qualifying readings.
/// None when fewer than two readings or no business time separates them.
/// A refill clamps to zero.
pub fn run_rate(qualifying: &[&TelemetryReading], settings: &AnalyticsSettings) -> Option<f64> {
    let (first, last) = match qualifying {
        [first, .., last] => (*first, *last),
        _ => return None,
    };

    let elapsed = business_hours_between(
        first.recorded_at,
        last.recorded_at,
        &settings.business_hours,
        &settings.utc_offset,
    );
    if elapsed <= 0.0 {
        return None;
    }

    let consumed = first.effective_volume() - last.effective_volume();
    Some((consumed / elapsed).max(0.0))
}

/// Hours of `[start, end]` that fall inside daily business windows.
pub fn business_hours_between(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    hours: &BusinessHours,
    offset: &FixedOffset,
) -> f64 {
    if end <= start {
        return 0.0;
    }

    let last_day = end.with_timezone(offset).date_naive();
    let mut day = start.with_timezone(offset).date_naive();
    let mut millis: i64 = 0;

    while day <= last_day {
        if let Some((open, close)) = hours.window_on(day, offset) {
            let lo = open.max(start);
            let hi = close.min(end);
            if hi > lo {
                millis += (hi - lo).num_milliseconds();
            }
        }
        match day.checked_add_days(Days::new(1)) {
            Some(next) => day = next,
            None => break,
        }
    }

    millis as f64 / 3_600_000.0
}

fn estimate_height_per_gallon(current: &TelemetryReading) -> Option<f64> {
    let volume = current.effective_volume();
    if current.height > 0.0 && volume > 0.0 {
        Some(current.height / volume)
    } else {
        None
    }
}

/// Hours to critical paired with the instant it is reached. A horizon past
/// the representable date range counts as not depleting.
fn project_critical(
    current_height: f64,
    critical_height: f64,
    run_rate_gph: f64,
    height_per_gallon: f64,
    now: DateTime<Utc>,
) -> Option<(f64, DateTime<Utc>)> {
    let hours = hours_to_critical(current_height, critical_height, run_rate_gph, height_per_gallon)?;
    let millis = (hours * 3_600_000.0).round() as i64;
    let at = chrono::Duration::try_milliseconds(millis).and_then(|d| now.checked_add_signed(d))?;
    Some((hours, at))
}

pub fn hours_to_critical(
    current_height: f64,
    critical_height: f64,
    run_rate_gph: f64,
    height_per_gallon: f64,
) -> Option<f64> {
    if run_rate_gph <= 0.0 || height_per_gallon <= 0.0 || current_height <= critical_height {
        return None;
    }

    let height_rate = run_rate_gph * height_per_gallon;
    let hours = (current_height - critical_height) / height_rate;
    (hours.is_finite() && hours >= 0.0).then_some(hours)
}

pub fn capacity_percent(volume: f64, max_capacity: f64) -> f64 {
    if max_capacity <= 0.0 {
        return 0.0;
    }
    (volume / max_capacity * 100.0).clamp(0.0, 100.0)
}

/// Gallons that can still be delivered before the tank reaches its max fill level.
pub fn available_ullage(capacity: f64, max_fill_percent: f64, current_volume: f64) -> f64 {
    (capacity * max_fill_percent / 100.0 - current_volume).max(0.0)
}

pub fn classify_status(
    current_height: f64,
    hours_to_critical: Option<f64>,
    tank: &TankConfig,
    settings: &AnalyticsSettings,
) -> TankStatus {
    let below = |limit: f64| hours_to_critical.is_some_and(|hours| hours < limit);

    if current_height <= tank.critical_height_in || below(settings.critical_hours) {
        TankStatus::Critical
    } else if current_height <= tank.warning_height_in || below(settings.warning_hours) {
        TankStatus::Warning
    } else {
        TankStatus::Normal
    }
}
