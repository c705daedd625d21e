//! KPI aggregation over the durable decision log.

pub mod aggregator;

pub use aggregator::{compute, KpiAccumulator, KpiAggregator};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of attack vectors reported.
pub const TOP_VECTORS: usize = 5;

/// Default trailing window length in days.
pub const DEFAULT_WINDOW_DAYS: i64 = 7;

/// Errors from KPI aggregation.
#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("failed to read decision log: {0}")]
    Source(#[from] std::io::Error),

    #[error("invalid window: start {start} must be before end {end}")]
    InvalidWindow { start: i64, end: i64 },
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KpiWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl KpiWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AggregationError> {
        if start >= end {
            return Err(AggregationError::InvalidWindow {
                start: start.timestamp_millis(),
                end: end.timestamp_millis(),
            });
        }
        Ok(KpiWindow { start, end })
    }

    /// The `days` days ending at `now`.
    pub fn trailing(days: i64, now: DateTime<Utc>) -> Self {
        KpiWindow {
            start: now - Duration::days(days.max(1)),
            end: now,
        }
    }

    /// Window from optional epoch-millisecond bounds.
    ///
    /// A missing end is `now`; a missing start is seven days before the end.
    pub fn from_millis(
        start: Option<i64>,
        end: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Self, AggregationError> {
        let end_ms = end.unwrap_or_else(|| now.timestamp_millis());
        let start_ms =
            start.unwrap_or_else(|| end_ms.saturating_sub(Duration::days(DEFAULT_WINDOW_DAYS).num_milliseconds()));

        let to_time = |ms: i64| {
            Utc.timestamp_millis_opt(ms)
                .single()
                .ok_or(AggregationError::InvalidWindow {
                    start: start_ms,
                    end: end_ms,
                })
        };

        KpiWindow::new(to_time(start_ms)?, to_time(end_ms)?)
    }

    /// Returns true if `timestamp_ms` falls inside the window.
    #[inline]
    pub fn contains_millis(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.start.timestamp_millis() && timestamp_ms < self.end.timestamp_millis()
    }
}

/// BLOCK count for one label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackVector {
    pub label: String,
    pub count: u64,
}

/// KPI result for one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiSnapshot {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_requests: u64,
    pub blocked_requests: u64,
    /// Percentage rounded to two places
    #[serde(with = "rust_decimal::serde::float")]
    pub percent_blocked: Decimal,
    pub top_5_attack_vectors: Vec<AttackVector>,
    /// Log lines that could not be parsed
    pub malformed_records: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_defaults_to_trailing_week() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let window = KpiWindow::from_millis(None, None, now).unwrap();

        assert_eq!(window.end, now);
        assert_eq!(window.end - window.start, Duration::days(7));
        assert_eq!(window, KpiWindow::trailing(DEFAULT_WINDOW_DAYS, now));
    }

    #[test]
    fn test_window_is_half_open() {
        let window = KpiWindow::from_millis(Some(1_000), Some(2_000), Utc::now()).unwrap();

        assert!(window.contains_millis(1_000));
        assert!(window.contains_millis(1_999));
        assert!(!window.contains_millis(2_000));
        assert!(!window.contains_millis(999));
    }

    #[test]
    fn test_empty_window_rejected() {
        assert!(matches!(
            KpiWindow::from_millis(Some(5_000), Some(5_000), Utc::now()),
            Err(AggregationError::InvalidWindow { start: 5_000, end: 5_000 })
        ));
    }

    #[test]
    fn test_percent_serialized_as_number() {
        let snapshot = KpiSnapshot {
            window_start: Utc.timestamp_millis_opt(0).unwrap(),
            window_end: Utc.timestamp_millis_opt(1).unwrap(),
            total_requests: 3,
            blocked_requests: 1,
            percent_blocked: Decimal::new(3333, 2),
            top_5_attack_vectors: vec![],
            malformed_records: 0,
        };

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"percent_blocked\":33.33"));
    }
}
