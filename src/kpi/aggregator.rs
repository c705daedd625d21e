use ahash::AHashMap;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use tracing::debug;

use crate::decision_log::{LogRecord, LogSource};
use crate::domain::{Action, DecisionStage};
use crate::observability::metrics;

use super::{AggregationError, AttackVector, KpiSnapshot, KpiWindow, TOP_VECTORS};

/// Running totals for one window, fed one log line at a time.
pub struct KpiAccumulator<'a> {
    window: &'a KpiWindow,
    total: u64,
    blocked: u64,
    malformed: u64,
    by_label: AHashMap<String, u64>,
}

impl<'a> KpiAccumulator<'a> {
    pub fn new(window: &'a KpiWindow) -> Self {
        KpiAccumulator {
            window,
            total: 0,
            blocked: 0,
            malformed: 0,
            by_label: AHashMap::new(),
        }
    }

    /// Count one line. Unparseable lines are skipped and counted.
    pub fn push_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let record = match LogRecord::parse_line(line) {
            Ok(record) => record,
            Err(e) => {
                self.malformed += 1;
                debug!(error = %e, "Skipping malformed decision record");
                return;
            }
        };

        if !self.window.contains_millis(record.timestamp) {
            return;
        }

        self.total += 1;
        if record.action == Action::Block {
            self.blocked += 1;
            *self.by_label.entry(record.label).or_insert(0) += 1;
        }
    }

    pub fn finish(self) -> KpiSnapshot {
        KpiSnapshot {
            window_start: self.window.start,
            window_end: self.window.end,
            total_requests: self.total,
            blocked_requests: self.blocked,
            percent_blocked: percent(self.blocked, self.total),
            top_5_attack_vectors: top_vectors(self.by_label),
            malformed_records: self.malformed,
        }
    }
}

/// Aggregate log lines over `window`.
///
/// Pure: the same lines and window always give the same snapshot.
pub fn compute<I, S>(lines: I, window: &KpiWindow) -> KpiSnapshot
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut acc = KpiAccumulator::new(window);
    for line in lines {
        acc.push_line(line.as_ref());
    }
    acc.finish()
}

/// `part / total * 100` to two places, halves away from zero.
fn percent(part: u64, total: u64) -> Decimal {
    if total == 0 {
        return Decimal::ZERO;
    }

    (Decimal::from(part) * Decimal::ONE_HUNDRED / Decimal::from(total))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Highest counts first, ties by ascending label.
fn top_vectors(by_label: AHashMap<String, u64>) -> Vec<AttackVector> {
    let mut vectors: Vec<AttackVector> = by_label
        .into_iter()
        .map(|(label, count)| AttackVector { label, count })
        .collect();

    vectors.sort_unstable_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    vectors.truncate(TOP_VECTORS);
    vectors
}

/// Read-only KPI queries over a log source.
#[derive(Clone)]
pub struct KpiAggregator {
    source: Arc<dyn LogSource>,
}

impl KpiAggregator {
    pub fn new(source: Arc<dyn LogSource>) -> Self {
        KpiAggregator { source }
    }

    /// Stream the log through an accumulator for `window`.
    pub fn aggregate(&self, window: &KpiWindow) -> Result<KpiSnapshot, AggregationError> {
        let mut acc = KpiAccumulator::new(window);
        self.source.for_each_line(&mut |line| acc.push_line(line))?;

        let snapshot = acc.finish();
        metrics::record_stage(DecisionStage::Aggregated, snapshot.total_requests as usize);
        Ok(snapshot)
    }
}
