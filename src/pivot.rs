//! Equipment × day status matrix and its tabular rendering.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use serde::Serialize;

use crate::collapse::DayOutcomes;
use crate::metrics::{
    column_metrics, DayMetrics, AVAILABILITY_LABEL, FAILURE_RATE_LABEL, TOTAL_FAILURES_LABEL,
};
use crate::models::{Outcome, DATE_FORMAT};

// ---

pub const ID_COLUMN: &str = "equipment_id";
pub const FAILED_COLUMN: &str = "Failed";
pub const MISSING_CELL: &str = "-";

/// One cell of the matrix. `Missing` means no test that day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Cell {
    // ---
    #[serde(rename = "pass")]
    Pass,
    #[serde(rename = "fail")]
    Fail,
    #[serde(rename = "-")]
    Missing,
}

impl Cell {
    // ---
    pub fn as_str(&self) -> &'static str {
        match self {
            Cell::Pass => Outcome::Pass.as_str(),
            Cell::Fail => Outcome::Fail.as_str(),
            Cell::Missing => MISSING_CELL,
        }
    }
}

impl From<Option<Outcome>> for Cell {
    fn from(outcome: Option<Outcome>) -> Self {
        match outcome {
            Some(Outcome::Pass) => Cell::Pass,
            Some(Outcome::Fail) => Cell::Fail,
            None => Cell::Missing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatrixRow {
    // ---
    pub equipment_id: String,
    pub cells: Vec<Cell>,
    /// Number of `fail` cells in this row.
    pub failed: usize,
}

/// Dashboard matrix for one site and date range.
///
/// Columns are only the dates on which some equipment has data; calendar
/// gaps are not filled in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardMatrix {
    // ---
    pub dates: Vec<NaiveDate>,
    pub rows: Vec<MatrixRow>,
    pub metrics: Vec<DayMetrics>,
}

impl DashboardMatrix {
    // ---
    pub fn build(days: &DayOutcomes) -> Self {
        // ---
        let dates = days.dates();
        let column: HashMap<NaiveDate, usize> =
            dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();

        let rows: Vec<MatrixRow> = days
            .equipment()
            .into_iter()
            .map(|equipment_id| {
                let mut cells = vec![Cell::Missing; dates.len()];
                for date in &dates {
                    let key = (equipment_id.to_string(), *date);
                    cells[column[date]] = Cell::from(days.get(&key));
                }
                let failed = cells.iter().filter(|c| **c == Cell::Fail).count();
                MatrixRow {
                    equipment_id: equipment_id.to_string(),
                    cells,
                    failed,
                }
            })
            .collect();

        let metrics = column_metrics(&dates, &rows);
        DashboardMatrix {
            dates,
            rows,
            metrics,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[cfg(test)]
    pub fn row(&self, equipment_id: &str) -> Option<&MatrixRow> {
        self.rows.iter().find(|r| r.equipment_id == equipment_id)
    }

    #[cfg(test)]
    pub fn cell(&self, equipment_id: &str, date: NaiveDate) -> Option<Cell> {
        // ---
        let col = self.dates.iter().position(|d| *d == date)?;
        self.row(equipment_id).map(|r| r.cells[col])
    }

    /// Render as a string table: equipment rows followed by the three metric
    /// rows. `noted` only sets the `has_notes` flag; ids are left untouched.
    pub fn to_table(&self, noted: &HashSet<String>) -> DashboardTable {
        // ---
        let mut columns = Vec::with_capacity(self.dates.len() + 2);
        columns.push(ID_COLUMN.to_string());
        columns.extend(self.dates.iter().map(|d| d.format(DATE_FORMAT).to_string()));
        columns.push(FAILED_COLUMN.to_string());

        let mut rows: Vec<TableRow> = self
            .rows
            .iter()
            .map(|row| {
                let mut values = Vec::with_capacity(columns.len());
                values.push(row.equipment_id.clone());
                values.extend(row.cells.iter().map(|c| c.as_str().to_string()));
                values.push(row.failed.to_string());
                TableRow {
                    kind: RowKind::Equipment,
                    has_notes: noted.contains(&row.equipment_id),
                    values,
                }
            })
            .collect();

        let metric_row = |label: &str, failed: &str, render: &dyn Fn(&DayMetrics) -> String| {
            let mut values = vec![label.to_string()];
            values.extend(self.metrics.iter().map(render));
            values.push(failed.to_string());
            TableRow {
                kind: RowKind::Metric,
                has_notes: false,
                values,
            }
        };
        rows.push(metric_row(TOTAL_FAILURES_LABEL, "0", &|m: &DayMetrics| {
            m.total_failures.to_string()
        }));
        rows.push(metric_row(FAILURE_RATE_LABEL, "", &|m: &DayMetrics| {
            m.failure_rate_label()
        }));
        rows.push(metric_row(AVAILABILITY_LABEL, "", &|m: &DayMetrics| {
            m.availability_label()
        }));

        DashboardTable { columns, rows }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    // ---
    Equipment,
    Metric,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRow {
    // ---
    pub kind: RowKind,
    pub has_notes: bool,
    pub values: Vec<String>,
}

/// Presentation-ready view of a [`DashboardMatrix`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardTable {
    // ---
    pub columns: Vec<String>,
    pub rows: Vec<TableRow>,
}

impl DashboardTable {
    // ---
    /// Keep equipment rows whose id contains `search` (case-insensitive).
    /// Metric rows are always kept as computed over the full matrix.
    pub fn filter(&self, search: &str) -> DashboardTable {
        // ---
        let needle = search.trim().to_lowercase();
        if needle.is_empty() {
            return self.clone();
        }
        let rows = self
            .rows
            .iter()
            .filter(|r| {
                r.kind == RowKind::Metric
                    || r.values
                        .first()
                        .is_some_and(|id| id.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        DashboardTable {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Sort equipment rows by `column`; metric rows stay at the bottom.
    ///
    /// Values compare numerically when every one of them parses as a number
    /// once `%` and `,` are stripped, lexically otherwise. Returns `false`
    /// for an unknown column.
    pub fn sort_by_column(&mut self, column: &str, descending: bool) -> bool {
        // ---
        let Some(idx) = self.columns.iter().position(|c| c == column) else {
            return false;
        };

        let (mut equipment, metrics): (Vec<TableRow>, Vec<TableRow>) = self
            .rows
            .drain(..)
            .partition(|r| r.kind == RowKind::Equipment);

        let numeric = equipment
            .iter()
            .all(|r| r.values.get(idx).and_then(|v| numeric_value(v)).is_some());

        equipment.sort_by(|a, b| {
            let (va, vb) = (&a.values[idx], &b.values[idx]);
            let ord = if numeric {
                numeric_value(va)
                    .partial_cmp(&numeric_value(vb))
                    .unwrap_or(Ordering::Equal)
            } else {
                va.cmp(vb)
            };
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });

        self.rows = equipment;
        self.rows.extend(metrics);
        true
    }

    pub fn equipment_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.rows
            .iter()
            .filter(|r| r.kind == RowKind::Equipment)
            .filter_map(|r| r.values.first().map(String::as_str))
    }
}

fn numeric_value(raw: &str) -> Option<f64> {
    raw.replace(['%', ','], "").trim().parse::<f64>().ok()
}
