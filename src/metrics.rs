//! Per-day metrics over the dashboard matrix and the daily aggregate series.
//!
//! Two output contracts live here and must not be confused:
//! - [`DayMetrics`] feeds the metric rows under the matrix; rates are
//!   rendered as percentage strings.
//! - [`DailyAggregate`] feeds charting; the failure rate is a plain ratio.
//!
//! With no observations a day reports a 0.00% failure rate and a 100.00%
//! availability at the same time. Both read as "no evidence of failure".

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::collapse::DayOutcomes;
use crate::models::Outcome;
use crate::pivot::{Cell, MatrixRow};

// ---

pub const TOTAL_FAILURES_LABEL: &str = "Total Failures";
pub const FAILURE_RATE_LABEL: &str = "Failure Rate";
pub const AVAILABILITY_LABEL: &str = "Availability";

/// Column metrics for one date of the dashboard matrix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayMetrics {
    // ---
    pub date: NaiveDate,
    pub total_failures: usize,
    pub passes: usize,
    pub tests_observed: usize,
}

impl DayMetrics {
    // ---
    pub fn failure_rate(&self) -> f64 {
        if self.tests_observed == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.tests_observed as f64
        }
    }

    pub fn availability(&self) -> f64 {
        if self.tests_observed == 0 {
            1.0
        } else {
            self.passes as f64 / self.tests_observed as f64
        }
    }

    pub fn failure_rate_label(&self) -> String {
        format_percent(self.failure_rate())
    }

    pub fn availability_label(&self) -> String {
        format_percent(self.availability())
    }
}

/// Render a ratio as a percentage with two decimals, e.g. `0.5` → `50.00%`.
pub fn format_percent(ratio: f64) -> String {
    format!("{:.2}%", ratio * 100.0)
}

/// Compute metrics for every date column across all equipment rows.
///
/// Missing cells count neither as a test nor as a failure.
pub fn column_metrics(dates: &[NaiveDate], rows: &[MatrixRow]) -> Vec<DayMetrics> {
    // ---
    dates
        .iter()
        .enumerate()
        .map(|(col, date)| {
            let mut metrics = DayMetrics {
                date: *date,
                total_failures: 0,
                passes: 0,
                tests_observed: 0,
            };
            for row in rows {
                match row.cells.get(col) {
                    Some(Cell::Fail) => {
                        metrics.total_failures += 1;
                        metrics.tests_observed += 1;
                    }
                    Some(Cell::Pass) => {
                        metrics.passes += 1;
                        metrics.tests_observed += 1;
                    }
                    Some(Cell::Missing) | None => {}
                }
            }
            metrics
        })
        .collect()
}

/// One day of the single-site chart series. Counts are of equipment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyAggregate {
    // ---
    pub date: NaiveDate,
    pub passes: usize,
    pub fails: usize,
    pub total_tests: usize,
    pub failure_rate: f64,
}

/// Build the per-date pass/fail series from day-level outcomes.
pub fn daily_series(days: &DayOutcomes) -> Vec<DailyAggregate> {
    // ---
    let mut by_date: BTreeMap<NaiveDate, (usize, usize)> = BTreeMap::new();
    for ((_, date), outcome) in days.iter() {
        let entry = by_date.entry(*date).or_default();
        match outcome {
            Outcome::Pass => entry.0 += 1,
            Outcome::Fail => entry.1 += 1,
        }
    }

    by_date
        .into_iter()
        .map(|(date, (passes, fails))| {
            let total_tests = passes + fails;
            let failure_rate = if total_tests > 0 {
                fails as f64 / total_tests as f64
            } else {
                0.0
            };
            DailyAggregate {
                date,
                passes,
                fails,
                total_tests,
                failure_rate,
            }
        })
        .collect()
}

/// Number of failing equipment per date.
pub fn daily_failed_counts(days: &DayOutcomes) -> BTreeMap<NaiveDate, usize> {
    // ---
    let mut counts = BTreeMap::new();
    for ((_, date), outcome) in days.iter() {
        if outcome.is_fail() {
            *counts.entry(*date).or_insert(0) += 1;
        }
    }
    counts
}
