// Sync cycle statistics
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

pub const ERROR_RING_CAPACITY: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct RecordedError {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Process-wide counters owned by the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct SyncCycleStats {
    pub started_at: DateTime<Utc>,
    pub cycle_count: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub recent_errors: VecDeque<RecordedError>,
    pub skipped_cycles: u64,
    pub readings_inserted: u64,
    pub duplicate_readings: u64,
    pub failed_tanks: u64,
    pub malformed_records: u64,
    pub cleanup_runs: u64,
    pub readings_expired: u64,
}

impl SyncCycleStats {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            cycle_count: 0,
            last_success: None,
            recent_errors: VecDeque::with_capacity(ERROR_RING_CAPACITY),
            skipped_cycles: 0,
            readings_inserted: 0,
            duplicate_readings: 0,
            failed_tanks: 0,
            malformed_records: 0,
            cleanup_runs: 0,
            readings_expired: 0,
        }
    }

    /// Push an error, evicting the oldest once the ring is full.
    pub fn record_error(&mut self, message: impl Into<String>) {
        if self.recent_errors.len() == ERROR_RING_CAPACITY {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(RecordedError {
            at: Utc::now(),
            message: message.into(),
        });
    }

    pub fn uptime(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_ring_is_bounded() {
        let mut stats = SyncCycleStats::new(Utc::now());
        for i in 0..15 {
            stats.record_error(format!("error {}", i));
        }

        assert_eq!(stats.recent_errors.len(), ERROR_RING_CAPACITY);
        assert_eq!(stats.recent_errors.front().unwrap().message, "error 5");
        assert_eq!(stats.recent_errors.back().unwrap().message, "error 14");
    }
}
