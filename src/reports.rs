//! Rankings, cross-site consolidation and the statistics report.
//!
//! Everything here is a pure function over already-fetched events or
//! collapsed outcomes; the service decides which sites to feed in.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{NaiveDate, Timelike};
use serde::Serialize;

use crate::collapse::{collapse_days, collapse_minutes, DayOutcomes};
use crate::metrics::{daily_failed_counts, daily_series, DailyAggregate};
use crate::models::TestEvent;

// ---

/// Failure-day count for one piece of equipment at one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteFailureRow {
    // ---
    pub rank: usize,
    pub equipment_id: String,
    pub serial: String,
    #[serde(rename = "Failed Days Count")]
    pub failed_days: usize,
}

/// Failure-day count summed over every site an equipment id appears in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsolidatedFailureRow {
    // ---
    #[serde(rename = "Rank")]
    pub rank: usize,
    pub equipment_id: String,
    pub serial: String,
    #[serde(rename = "Total Failed Days (All Sites)")]
    pub total_failed_days: usize,
    #[serde(rename = "Sites Affected")]
    pub sites_affected: String,
}

/// One site's daily aggregate row in the consolidated trend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteDailyAggregate {
    // ---
    pub site: String,
    #[serde(flatten)]
    pub aggregate: DailyAggregate,
}

/// Everything the multi-site export needs from one site.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteReport {
    // ---
    pub site: String,
    pub ranking: Vec<SiteFailureRow>,
    pub daily_failed: BTreeMap<NaiveDate, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommonFailures {
    // ---
    pub equipment_with_failures: usize,
    pub top: Vec<SiteFailureRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntervalCount {
    // ---
    pub equipment_id: String,
    pub date: NaiveDate,
    /// Start of the 30-minute window, `HH:MM`.
    pub interval: String,
    pub test_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestedEquipment {
    // ---
    pub equipment_id: String,
    pub test_days: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeCount {
    // ---
    pub outcome: String,
    pub count: u64,
    pub percentage: f64,
}

/// Database statistics for the selected site.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseStats {
    // ---
    pub site: String,
    pub total_records: u64,
    pub unique_equipment: u64,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub size_mb: f64,
    pub equipment_with_notes: u64,
    pub total_notes: u64,
    pub outcomes: Vec<OutcomeCount>,
    pub top_tested: Vec<TestedEquipment>,
}

/// Most frequent serial per equipment id.
///
/// Ties resolve to the lexically smallest candidate so the choice does not
/// depend on row order. Equipment without any serial maps to `""`.
pub fn serial_modes(events: &[TestEvent]) -> HashMap<String, String> {
    // ---
    let mut counts: HashMap<&str, BTreeMap<&str, usize>> = HashMap::new();
    for event in events {
        let per_id = counts.entry(event.equipment_id.as_str()).or_default();
        if let Some(serial) = event.serial.as_deref() {
            *per_id.entry(serial).or_insert(0) += 1;
        }
    }

    counts
        .into_iter()
        .map(|(id, serials)| {
            let mut best: Option<(&str, usize)> = None;
            for (serial, n) in serials {
                if best.map_or(true, |(_, top)| n > top) {
                    best = Some((serial, n));
                }
            }
            (
                id.to_string(),
                best.map(|(s, _)| s.to_string()).unwrap_or_default(),
            )
        })
        .collect()
}

/// Count distinct failing days per equipment, first-appearance order.
fn failed_days(days: &DayOutcomes) -> Vec<(String, usize)> {
    // ---
    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for ((equipment_id, _), outcome) in days.iter() {
        if !outcome.is_fail() {
            continue;
        }
        let count = counts.entry(equipment_id.clone()).or_insert_with(|| {
            order.push(equipment_id.clone());
            0
        });
        *count += 1;
    }
    order
        .into_iter()
        .map(|id| {
            let n = counts[&id];
            (id, n)
        })
        .collect()
}

/// Single-site failure-day ranking, highest first, stable on ties.
///
/// Only equipment with at least one failing day is listed.
pub fn failure_day_ranking(events: &[TestEvent], days: &DayOutcomes) -> Vec<SiteFailureRow> {
    // ---
    let serials = serial_modes(events);
    let mut rows: Vec<SiteFailureRow> = failed_days(days)
        .into_iter()
        .map(|(equipment_id, failed_days)| SiteFailureRow {
            rank: 0,
            serial: serials.get(&equipment_id).cloned().unwrap_or_default(),
            equipment_id,
            failed_days,
        })
        .collect();

    rows.sort_by(|a, b| b.failed_days.cmp(&a.failed_days));
    for (i, row) in rows.iter_mut().enumerate() {
        row.rank = i + 1;
    }
    rows
}

/// Merge per-site rankings into one all-site ranking.
///
/// Equipment ids are treated as globally unique: the same id at two sites
/// has its counts summed. The serial is the first one seen.
pub fn consolidate_rankings(per_site: &[(String, Vec<SiteFailureRow>)]) -> Vec<ConsolidatedFailureRow> {
    // ---
    struct Acc {
        serial: String,
        total: usize,
        sites: BTreeSet<String>,
    }

    let mut order: Vec<String> = Vec::new();
    let mut acc: HashMap<String, Acc> = HashMap::new();
    for (site, rows) in per_site {
        for row in rows {
            let entry = acc.entry(row.equipment_id.clone()).or_insert_with(|| {
                order.push(row.equipment_id.clone());
                Acc {
                    serial: row.serial.clone(),
                    total: 0,
                    sites: BTreeSet::new(),
                }
            });
            entry.total += row.failed_days;
            entry.sites.insert(site.clone());
        }
    }

    let mut merged: Vec<ConsolidatedFailureRow> = order
        .into_iter()
        .filter_map(|id| {
            let a = acc.remove(&id)?;
            Some(ConsolidatedFailureRow {
                rank: 0,
                equipment_id: id,
                serial: a.serial,
                total_failed_days: a.total,
                sites_affected: a.sites.into_iter().collect::<Vec<_>>().join(", "),
            })
        })
        .collect();

    merged.sort_by(|a, b| b.total_failed_days.cmp(&a.total_failed_days));
    for (i, row) in merged.iter_mut().enumerate() {
        row.rank = i + 1;
    }
    merged
}

/// Tag each site's daily series with the site name and concatenate.
pub fn consolidated_trend(per_site: &[(String, DayOutcomes)]) -> Vec<SiteDailyAggregate> {
    // ---
    per_site
        .iter()
        .flat_map(|(site, days)| {
            daily_series(days)
                .into_iter()
                .map(move |aggregate| SiteDailyAggregate {
                    site: site.clone(),
                    aggregate,
                })
        })
        .collect()
}

/// Collect one site's ranking and chart data for the multi-site export.
pub fn site_report(site: &str, events: &[TestEvent], days: &DayOutcomes) -> SiteReport {
    // ---
    SiteReport {
        site: site.to_string(),
        ranking: failure_day_ranking(events, days),
        daily_failed: daily_failed_counts(days),
    }
}

/// Top `limit` equipment by failing days plus how many failed at all.
pub fn common_failures(events: &[TestEvent], days: &DayOutcomes, limit: usize) -> CommonFailures {
    // ---
    let ranking = failure_day_ranking(events, days);
    CommonFailures {
        equipment_with_failures: ranking.len(),
        top: ranking.into_iter().take(limit).collect(),
    }
}

/// Raw test counts per equipment, date and 30-minute window.
pub fn interval_counts(events: &[TestEvent]) -> Vec<IntervalCount> {
    // ---
    let mut counts: BTreeMap<(&str, NaiveDate, u32), usize> = BTreeMap::new();
    for event in events {
        let t = event.time_tested;
        let slot = t.hour() * 60 + (t.minute() / 30) * 30;
        *counts
            .entry((event.equipment_id.as_str(), t.date(), slot))
            .or_insert(0) += 1;
    }

    counts
        .into_iter()
        .map(|((equipment_id, date, slot), test_count)| IntervalCount {
            equipment_id: equipment_id.to_string(),
            date,
            interval: format!("{:02}:{:02}", slot / 60, slot % 60),
            test_count,
        })
        .collect()
}

/// Equipment with the most distinct test days, highest first.
pub fn top_tested_equipment(events: &[TestEvent], limit: usize) -> Vec<TestedEquipment> {
    // ---
    let days = collapse_days(&collapse_minutes(events));
    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for ((equipment_id, _), _) in days.iter() {
        let count = counts.entry(equipment_id.clone()).or_insert_with(|| {
            order.push(equipment_id.clone());
            0
        });
        *count += 1;
    }

    let mut ranked: Vec<TestedEquipment> = order
        .into_iter()
        .map(|equipment_id| TestedEquipment {
            test_days: counts[&equipment_id],
            equipment_id,
        })
        .collect();
    ranked.sort_by(|a, b| b.test_days.cmp(&a.test_days));
    ranked.truncate(limit);
    ranked
}
