//! Spreadsheet and CSV export.
//!
//! The dashboard export writes identity strings exactly as stored; the
//! notes flag never reaches the file.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use chrono::NaiveDate;
use rust_xlsxwriter::{
    Chart, ChartFormat, ChartLegendPosition, ChartLine, ChartMarker, ChartMarkerType, ChartSolidFill,
    ChartType, Color, Format, Workbook, Worksheet,
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ExportError;
use crate::models::{DateRange, DATE_FORMAT};
use crate::pivot::{DashboardTable, RowKind, FAILED_COLUMN};
use crate::reports::SiteReport;

// ---

pub const SUMMARY_SHEET: &str = "Consolidated Summary";

/// Excel's sheet name limit.
const MAX_SHEET_NAME: usize = 31;

const SERIES_COLORS: [u32; 8] = [
    0xFF0000, 0x0000FF, 0x00AA00, 0xFF8C00, 0x9400D3, 0x00CED1, 0xDC143C, 0xFFD700,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    // ---
    Xlsx,
    Csv,
}

impl ExportFormat {
    /// Pick a format from the file extension; anything but `.csv` is xlsx.
    pub fn from_path(path: &Path) -> Self {
        // ---
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => ExportFormat::Csv,
            _ => ExportFormat::Xlsx,
        }
    }
}

/// Write the dashboard table, metric rows included.
pub fn write_dashboard(
    table: &DashboardTable,
    path: &Path,
    format: ExportFormat,
) -> Result<usize, ExportError> {
    // ---
    if table.rows.iter().all(|r| r.kind == RowKind::Metric) {
        return Err(ExportError::NoData);
    }

    match format {
        ExportFormat::Csv => write_dashboard_csv(table, path)?,
        ExportFormat::Xlsx => write_dashboard_xlsx(table, path)?,
    }
    info!("Dashboard exported to {} ({} rows)", path.display(), table.rows.len());
    Ok(table.rows.len())
}

fn write_dashboard_csv(table: &DashboardTable, path: &Path) -> Result<(), ExportError> {
    // ---
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&table.columns)?;
    for row in &table.rows {
        writer.write_record(&row.values)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_dashboard_xlsx(table: &DashboardTable, path: &Path) -> Result<(), ExportError> {
    // ---
    let bold = Format::new().set_bold();
    let failed_col = table.columns.iter().position(|c| c == FAILED_COLUMN);

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Dashboard")?;

    for (col, title) in table.columns.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, title.as_str(), &bold)?;
    }
    for (i, row) in table.rows.iter().enumerate() {
        let r = i as u32 + 1;
        for (col, value) in row.values.iter().enumerate() {
            let count = (Some(col) == failed_col && row.kind == RowKind::Equipment)
                .then(|| value.parse::<f64>().ok())
                .flatten();
            match count {
                Some(n) => sheet.write_number(r, col as u16, n)?,
                None => sheet.write_string(r, col as u16, value.as_str())?,
            };
        }
    }
    sheet.set_column_width(0, 20)?;

    workbook.save(path)?;
    Ok(())
}

/// Characters Excel rejects in sheet names.
const INVALID_SHEET_CHARS: [char; 7] = ['[', ']', ':', '*', '?', '/', '\\'];

/// Make a site name a valid sheet name: invalid characters become `_`,
/// surrounding apostrophes are dropped and the result is truncated.
pub fn sheet_name(site: &str) -> String {
    // ---
    let cleaned: String = site
        .chars()
        .map(|c| if INVALID_SHEET_CHARS.contains(&c) { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_matches('\'');
    if cleaned.is_empty() {
        return "Site".to_string();
    }
    cleaned.chars().take(MAX_SHEET_NAME).collect()
}

/// Sheet names for `sites`, unique ignoring case and never clashing with
/// the summary sheet. A clash gets a ` (n)` suffix within the length limit.
pub fn unique_sheet_names(sites: &[&str]) -> Vec<String> {
    // ---
    let mut used: HashSet<String> = HashSet::from([SUMMARY_SHEET.to_lowercase()]);
    sites
        .iter()
        .map(|site| {
            let base = sheet_name(site);
            let mut name = base.clone();
            let mut n = 2;
            while used.contains(&name.to_lowercase()) {
                let suffix = format!(" ({n})");
                let keep = MAX_SHEET_NAME - suffix.chars().count();
                name = base.chars().take(keep).collect::<String>() + &suffix;
                n += 1;
            }
            used.insert(name.to_lowercase());
            name
        })
        .collect()
}

/// Multi-site fail-count workbook: one ranking sheet per site with failures
/// plus a consolidated daily table with a line chart underneath.
///
/// Sites without failed days get no sheet of their own but still appear
/// as a zero column in the summary.
pub fn write_fail_count_report(
    reports: &[SiteReport],
    range: &DateRange,
    path: &Path,
) -> Result<(), ExportError> {
    // ---
    if reports.is_empty() {
        return Err(ExportError::NoData);
    }

    let mut sorted: Vec<&SiteReport> = reports.iter().collect();
    sorted.sort_by(|a, b| a.site.cmp(&b.site));

    let with_failures: Vec<&SiteReport> = sorted
        .iter()
        .copied()
        .filter(|r| !r.ranking.is_empty())
        .collect();
    let sites: Vec<&str> = with_failures.iter().map(|r| r.site.as_str()).collect();
    let names = unique_sheet_names(&sites);

    let bold = Format::new().set_bold();
    let mut workbook = Workbook::new();

    for (report, name) in with_failures.iter().zip(&names) {
        let sheet = workbook.add_worksheet();
        write_site_sheet(sheet, report, name, &bold)?;
    }

    let sheet = workbook.add_worksheet();
    write_summary_sheet(sheet, &sorted, range, &bold)?;

    workbook.save(path)?;
    info!(
        "Fail-count report for {} sites ({} with failures) written to {}",
        sorted.len(),
        with_failures.len(),
        path.display()
    );
    Ok(())
}

fn write_site_sheet(
    sheet: &mut Worksheet,
    report: &SiteReport,
    name: &str,
    bold: &Format,
) -> Result<(), ExportError> {
    // ---
    sheet.set_name(name)?;
    for (col, title) in ["equipment_id", "serial", "Failed Days Count"].iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *title, bold)?;
    }
    for (i, row) in report.ranking.iter().enumerate() {
        let r = i as u32 + 1;
        sheet.write_string(r, 0, row.equipment_id.as_str())?;
        // Serials are identifiers; keep leading zeros.
        sheet.write_string(r, 1, row.serial.as_str())?;
        sheet.write_number(r, 2, row.failed_days as f64)?;
    }
    sheet.set_column_width(0, 18)?;
    sheet.set_column_width(1, 18)?;
    sheet.set_column_width(2, 18)?;
    debug!("Wrote sheet '{}' for {} ({} rows)", name, report.site, report.ranking.len());
    Ok(())
}

fn write_summary_sheet(
    sheet: &mut Worksheet,
    reports: &[&SiteReport],
    range: &DateRange,
    bold: &Format,
) -> Result<(), ExportError> {
    // ---
    sheet.set_name(SUMMARY_SHEET)?;

    let dates: BTreeSet<NaiveDate> = reports
        .iter()
        .flat_map(|r| r.daily_failed.keys().copied())
        .collect();

    sheet.write_string_with_format(0, 0, "Date", bold)?;
    for (i, report) in reports.iter().enumerate() {
        sheet.write_string_with_format(0, i as u16 + 1, report.site.as_str(), bold)?;
    }
    for (r, date) in dates.iter().enumerate() {
        let row = r as u32 + 1;
        sheet.write_string(row, 0, date.format(DATE_FORMAT).to_string())?;
        for (i, report) in reports.iter().enumerate() {
            let count = report.daily_failed.get(date).copied().unwrap_or(0);
            sheet.write_number(row, i as u16 + 1, count as f64)?;
        }
    }
    sheet.set_column_width(0, 12)?;

    if dates.is_empty() {
        return Ok(());
    }

    let last_row = dates.len() as u32;
    let mut chart = Chart::new(ChartType::Line);
    let title = format!("Daily Failure Count Trend - All Sites ({range})");
    chart.title().set_name(title.as_str());
    chart.x_axis().set_name("Date");
    chart.y_axis().set_name("Number of Failed Equipment");
    chart.legend().set_position(ChartLegendPosition::Right);
    chart.set_width(960).set_height(480);

    for (i, _) in reports.iter().enumerate() {
        let col = i as u16 + 1;
        let color = Color::RGB(SERIES_COLORS[i % SERIES_COLORS.len()]);
        chart
            .add_series()
            .set_name((SUMMARY_SHEET, 0, col))
            .set_categories((SUMMARY_SHEET, 1, 0, last_row, 0))
            .set_values((SUMMARY_SHEET, 1, col, last_row, col))
            .set_format(ChartFormat::new().set_line(ChartLine::new().set_color(color).set_width(2.5)))
            .set_marker(
                ChartMarker::new()
                    .set_type(ChartMarkerType::Circle)
                    .set_size(7)
                    .set_format(
                        ChartFormat::new().set_solid_fill(ChartSolidFill::new().set_color(color)),
                    ),
            );
    }

    sheet.insert_chart(last_row + 3, 0, &chart)?;
    Ok(())
}

/// Per-date failing-equipment counts for every site, 0 where a site has
/// no entry. Same shape as the summary sheet.
pub fn summary_table(reports: &[SiteReport]) -> BTreeMap<NaiveDate, BTreeMap<String, usize>> {
    // ---
    let sites: BTreeSet<&str> = reports.iter().map(|r| r.site.as_str()).collect();
    let mut table: BTreeMap<NaiveDate, BTreeMap<String, usize>> = BTreeMap::new();
    for report in reports {
        for date in report.daily_failed.keys() {
            table.entry(*date).or_insert_with(|| {
                sites.iter().map(|s| (s.to_string(), 0)).collect()
            });
        }
    }
    for report in reports {
        for (date, count) in &report.daily_failed {
            if let Some(row) = table.get_mut(date) {
                row.insert(report.site.clone(), *count);
            }
        }
    }
    table
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::collapse::{collapse_days, collapse_minutes};
    use crate::models::{Outcome, TestEvent};
    use crate::pivot::DashboardMatrix;
    use crate::reports::site_report;
    use calamine::{open_workbook_auto, Reader};
    use chrono::NaiveDateTime;

    fn ev(id: &str, at: &str, outcome: Outcome) -> TestEvent {
        TestEvent::new(
            id,
            NaiveDateTime::parse_from_str(at, "%Y-%m-%d %H:%M:%S").unwrap(),
            outcome,
        )
        .with_serial("007")
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn sample_report(site: &str, id: &str) -> SiteReport {
        // ---
        let events = vec![
            ev(id, "2024-01-01 08:00:00", Outcome::Fail),
            ev(id, "2024-01-02 08:00:00", Outcome::Fail),
            ev("OK", "2024-01-02 08:00:00", Outcome::Pass),
        ];
        let days = collapse_days(&collapse_minutes(&events));
        site_report(site, &events, &days)
    }

    fn sample_table() -> DashboardTable {
        // ---
        let events = vec![
            ev("E1", "2024-01-01 08:00:00", Outcome::Fail),
            ev("E2", "2024-01-01 09:00:00", Outcome::Pass),
        ];
        let days = collapse_days(&collapse_minutes(&events));
        let noted: HashSet<String> = ["E1".to_string()].into_iter().collect();
        DashboardMatrix::build(&days).to_table(&noted)
    }

    #[test]
    fn test_format_from_extension() {
        // ---
        assert_eq!(ExportFormat::from_path(Path::new("a.CSV")), ExportFormat::Csv);
        assert_eq!(ExportFormat::from_path(Path::new("a.xlsx")), ExportFormat::Xlsx);
        assert_eq!(ExportFormat::from_path(Path::new("a")), ExportFormat::Xlsx);
    }

    #[test]
    fn test_dashboard_csv_keeps_raw_ids() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dash.csv");
        let written = write_dashboard(&sample_table(), &path, ExportFormat::Csv).unwrap();
        assert_eq!(written, 5);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "equipment_id,2024-01-01,Failed");
        assert_eq!(lines[1], "E1,fail,1");
        assert_eq!(lines[3], "Total Failures,1,0");
        assert_eq!(lines[4], "Failure Rate,50.00%,");
    }

    #[test]
    fn test_dashboard_xlsx_is_readable() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dash.xlsx");
        write_dashboard(&sample_table(), &path, ExportFormat::Xlsx).unwrap();

        let mut workbook = open_workbook_auto(&path).unwrap();
        let range = workbook.worksheet_range("Dashboard").unwrap().unwrap();
        assert_eq!(range.get_value((1, 0)).unwrap().to_string(), "E1");
        assert_eq!(range.get_value((1, 2)).unwrap().get_float(), Some(1.0));
    }

    #[test]
    fn test_empty_dashboard_is_not_exported() {
        // ---
        let days = collapse_days(&collapse_minutes(&Vec::<TestEvent>::new()));
        let table = DashboardMatrix::build(&days).to_table(&HashSet::new());
        let dir = tempfile::tempdir().unwrap();
        let err = write_dashboard(&table, &dir.path().join("x.csv"), ExportFormat::Csv);
        assert!(matches!(err, Err(ExportError::NoData)));
    }

    #[test]
    fn test_fail_count_report_sheets() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fails.xlsx");
        let long_name = "A Very Long Site Name That Exceeds Limits";
        let reports = vec![sample_report("Saffy", "S1"), sample_report(long_name, "L1")];
        let range = DateRange::new(day(1), day(2));
        write_fail_count_report(&reports, &range, &path).unwrap();

        let mut workbook = open_workbook_auto(&path).unwrap();
        let names = workbook.sheet_names().to_vec();
        assert_eq!(
            names,
            vec![sheet_name(long_name), "Saffy".to_string(), SUMMARY_SHEET.to_string()]
        );
        assert_eq!(names[0].chars().count(), 31);

        let saffy = workbook.worksheet_range("Saffy").unwrap().unwrap();
        assert_eq!(saffy.get_value((1, 0)).unwrap().to_string(), "S1");
        assert_eq!(saffy.get_value((1, 1)).unwrap().get_string(), Some("007"));
        assert_eq!(saffy.get_value((1, 2)).unwrap().get_float(), Some(2.0));

        let summary = workbook.worksheet_range(SUMMARY_SHEET).unwrap().unwrap();
        assert_eq!(summary.get_value((0, 2)).unwrap().to_string(), "Saffy");
        assert_eq!(summary.get_value((1, 0)).unwrap().to_string(), "2024-01-01");
        assert_eq!(summary.get_value((2, 2)).unwrap().get_float(), Some(1.0));
    }

    #[test]
    fn test_sheet_names_are_sanitised_and_unique() {
        // ---
        assert_eq!(sheet_name("Shaft 4/5 [north]"), "Shaft 4_5 _north_");
        assert_eq!(sheet_name("'?'"), "_");
        assert_eq!(sheet_name("''"), "Site");

        let prefix = "Glencore Mpumalanga Underground";
        let a = format!("{prefix} East");
        let b = format!("{prefix} West");
        let names = unique_sheet_names(&[&a, &b, "consolidated summary", "K3"]);
        assert_eq!(names[0], prefix);
        assert_eq!(names[1], format!("{} (2)", &prefix[..27]));
        assert_eq!(names[2], "consolidated summary (2)");
        assert_eq!(names[3], "K3");
        assert!(names.iter().all(|n| n.chars().count() <= 31));
    }

    #[test]
    fn test_colliding_site_names_still_export() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fails.xlsx");
        let prefix = "Glencore Mpumalanga Underground";
        let reports = vec![
            sample_report(&format!("{prefix} East"), "E1"),
            sample_report(&format!("{prefix} West"), "W1"),
            sample_report("Pit: A*", "P1"),
        ];
        let range = DateRange::new(day(1), day(2));
        write_fail_count_report(&reports, &range, &path).unwrap();

        let workbook = open_workbook_auto(&path).unwrap();
        assert_eq!(workbook.sheet_names().len(), 4);
    }

    #[test]
    fn test_site_without_failures_gets_no_sheet() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fails.xlsx");
        let events = vec![ev("OK", "2024-01-01 08:00:00", Outcome::Pass)];
        let days = collapse_days(&collapse_minutes(&events));
        let quiet = site_report("K3", &events, &days);
        assert!(quiet.ranking.is_empty());

        let reports = vec![sample_report("Saffy", "S1"), quiet];
        let range = DateRange::new(day(1), day(2));
        write_fail_count_report(&reports, &range, &path).unwrap();

        let mut workbook = open_workbook_auto(&path).unwrap();
        assert_eq!(
            workbook.sheet_names().to_vec(),
            vec!["Saffy".to_string(), SUMMARY_SHEET.to_string()]
        );
        let summary = workbook.worksheet_range(SUMMARY_SHEET).unwrap().unwrap();
        assert_eq!(summary.get_value((0, 1)).unwrap().to_string(), "K3");
        assert_eq!(summary.get_value((1, 1)).unwrap().get_float(), Some(0.0));
    }

    #[test]
    fn test_summary_table_fills_missing_sites_with_zero() {
        // ---
        let mut quiet = sample_report("K3", "K1");
        quiet.daily_failed.remove(&day(1));
        let table = summary_table(&[sample_report("Saffy", "S1"), quiet]);

        assert_eq!(table[&day(1)]["K3"], 0);
        assert_eq!(table[&day(1)]["Saffy"], 1);
        assert_eq!(table[&day(2)]["K3"], 1);
    }

    #[test]
    fn test_no_sites_is_no_data() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let range = DateRange::new(day(1), day(2));
        let err = write_fail_count_report(&[], &range, &dir.path().join("x.xlsx"));
        assert!(matches!(err, Err(ExportError::NoData)));
    }
}
