//! Spreadsheet import of raw test rows.
//!
//! A file with a missing column is skipped; bad rows inside a good file are
//! dropped and counted. Nothing is written until every file has been read,
//! and then in one transaction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, DataType, Reader};
use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::collapse::dedup_events;
use crate::error::{AuditError, ImportError};
use crate::models::{Outcome, TestEvent};
use crate::store::SiteStore;
use crate::tasks::TaskContext;

// ---

/// Human header → internal column name.
pub const COLUMN_MAP: [(&str, &str); 11] = [
    ("Equipment Id", "equipment_id"),
    ("Serial", "serial"),
    ("Equipment Type", "equipment_type"),
    ("Employee", "employee_id"),
    ("Name", "technician_name"),
    ("Section", "section"),
    ("Shift", "shift"),
    ("Time Tested", "time_tested"),
    ("Gas Type", "gas_type"),
    ("Measured Value", "measured_value"),
    ("Outcome", "outcome"),
];

/// Numeric values strictly between these bounds are read as serial dates.
const SERIAL_MIN: f64 = 1.0;
const SERIAL_MAX: f64 = 90000.0;

const TEXT_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_ONLY_FORMATS: [&str; 2] = ["%Y-%m-%d", "%d/%m/%Y"];

/// A cell as read from a workbook, independent of the reader library.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCell {
    // ---
    Empty,
    Text(String),
    Number(f64),
    /// Spreadsheet date/time value, as a serial day number.
    DateTime(f64),
}

impl RawCell {
    /// Text content; whole numbers render without a fraction.
    fn text(&self) -> Option<String> {
        // ---
        match self {
            RawCell::Empty => None,
            RawCell::Text(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_string())
            }
            RawCell::Number(n) | RawCell::DateTime(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    Some(format!("{}", *n as i64))
                } else {
                    Some(n.to_string())
                }
            }
        }
    }

    fn number(&self) -> Option<f64> {
        // ---
        match self {
            RawCell::Number(n) => Some(*n),
            RawCell::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<&DataType> for RawCell {
    fn from(cell: &DataType) -> Self {
        // ---
        match cell {
            DataType::Empty => RawCell::Empty,
            DataType::String(s) => RawCell::Text(s.clone()),
            DataType::Float(f) => RawCell::Number(*f),
            DataType::Int(i) => RawCell::Number(*i as f64),
            DataType::Bool(b) => RawCell::Text(b.to_string()),
            DataType::DateTime(f) => RawCell::DateTime(*f),
            DataType::DateTimeIso(s) => RawCell::Text(s.clone()),
            _ => RawCell::Empty,
        }
    }
}

/// First worksheet of a workbook: header row plus data rows.
#[derive(Debug, Clone, Default)]
pub struct RawSheet {
    // ---
    pub headers: Vec<String>,
    pub rows: Vec<Vec<RawCell>>,
}

/// Read the first worksheet of an `.xlsx`/`.xls` file. Blocking.
pub fn read_workbook(path: &Path) -> Result<RawSheet, ImportError> {
    // ---
    let mut workbook =
        open_workbook_auto(path).map_err(|e| ImportError::Workbook(e.to_string()))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(ImportError::EmptyWorkbook)?;
    debug!("Reading worksheet '{}' from {}", sheet_name, path.display());

    let range = match workbook.worksheet_range(&sheet_name) {
        Some(Ok(range)) => range,
        Some(Err(e)) => return Err(ImportError::Workbook(e.to_string())),
        None => return Err(ImportError::EmptyWorkbook),
    };

    let mut rows = range.rows();
    let headers = rows
        .next()
        .map(|row| row.iter().map(|c| c.to_string().trim().to_string()).collect())
        .unwrap_or_default();
    let rows = rows
        .map(|row| row.iter().map(RawCell::from).collect())
        .collect();

    Ok(RawSheet { headers, rows })
}

/// Events parsed from one sheet plus what was dropped on the way.
#[derive(Debug, Clone, Default)]
pub struct ParsedSheet {
    // ---
    pub events: Vec<TestEvent>,
    pub dropped_dates: usize,
    pub dropped_outcomes: usize,
    pub dropped_ids: usize,
}

/// Map the header row onto internal column indexes.
///
/// Human headers and internal names are both accepted, ignoring case.
fn column_indexes(headers: &[String]) -> Result<HashMap<&'static str, usize>, ImportError> {
    // ---
    let mut indexes = HashMap::new();
    for (idx, header) in headers.iter().enumerate() {
        let header = header.trim();
        for (human, internal) in COLUMN_MAP {
            if header.eq_ignore_ascii_case(human) || header.eq_ignore_ascii_case(internal) {
                indexes.entry(internal).or_insert(idx);
            }
        }
    }

    let missing: Vec<String> = COLUMN_MAP
        .iter()
        .filter(|(_, internal)| !indexes.contains_key(internal))
        .map(|(_, internal)| internal.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ImportError::MissingColumns(missing));
    }
    Ok(indexes)
}

static EMPTY_CELL: RawCell = RawCell::Empty;

fn column_cell<'a>(
    row: &'a [RawCell],
    columns: &HashMap<&'static str, usize>,
    name: &str,
) -> &'a RawCell {
    // ---
    columns
        .get(name)
        .and_then(|idx| row.get(*idx))
        .unwrap_or(&EMPTY_CELL)
}

pub fn parse_sheet(sheet: &RawSheet) -> Result<ParsedSheet, ImportError> {
    // ---
    let columns = column_indexes(&sheet.headers)?;
    let mut parsed = ParsedSheet::default();

    for row in &sheet.rows {
        let cell = |name: &str| column_cell(row, &columns, name);
        let text = |name: &str| column_cell(row, &columns, name).text();

        if row.iter().all(|c| *c == RawCell::Empty) {
            continue;
        }

        let Some(time_tested) = parse_time_cell(cell("time_tested")) else {
            parsed.dropped_dates += 1;
            continue;
        };
        let Some(equipment_id) = text("equipment_id") else {
            parsed.dropped_ids += 1;
            continue;
        };
        let Some(outcome) = text("outcome").and_then(|o| o.parse::<Outcome>().ok()) else {
            parsed.dropped_outcomes += 1;
            continue;
        };

        parsed.events.push(TestEvent {
            equipment_id,
            serial: text("serial"),
            equipment_type: text("equipment_type"),
            employee_id: text("employee_id"),
            technician_name: text("technician_name"),
            section: text("section"),
            shift: text("shift"),
            time_tested,
            gas_type: text("gas_type"),
            measured_value: cell("measured_value").number(),
            outcome,
        });
    }

    Ok(parsed)
}

/// Convert a serial day number (origin 1899-12-30) to a timestamp,
/// rounded to the nearest second.
pub fn excel_serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    // ---
    if !serial.is_finite() {
        return None;
    }
    let origin = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let seconds = (serial * 86_400.0).round() as i64;
    origin.checked_add_signed(Duration::try_seconds(seconds)?)
}

/// Drop sub-second precision.
pub fn normalize_timestamp(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0).unwrap_or(ts)
}

fn serial_in_range(value: f64) -> Option<NaiveDateTime> {
    // ---
    if value > SERIAL_MIN && value < SERIAL_MAX {
        excel_serial_to_datetime(value)
    } else {
        None
    }
}

/// Parse a textual timestamp. A purely numeric string is a serial date.
pub fn parse_time_text(raw: &str) -> Option<NaiveDateTime> {
    // ---
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(value) = raw.parse::<f64>() {
        return serial_in_range(value);
    }
    TEXT_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATE_ONLY_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_time_cell(cell: &RawCell) -> Option<NaiveDateTime> {
    // ---
    let ts = match cell {
        RawCell::Empty => None,
        RawCell::DateTime(serial) => excel_serial_to_datetime(*serial),
        RawCell::Number(value) => serial_in_range(*value),
        RawCell::Text(s) => parse_time_text(s),
    };
    ts.map(normalize_timestamp)
}

/// Outcome of importing one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileImportReport {
    // ---
    pub file: String,
    pub imported: usize,
    pub dropped_dates: usize,
    pub dropped_outcomes: usize,
    pub dropped_ids: usize,
    pub duplicates: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportSummary {
    // ---
    pub files: Vec<FileImportReport>,
    pub total_imported: usize,
    pub total_dropped: usize,
    pub total_duplicates: usize,
    pub failed_files: usize,
}

impl ImportSummary {
    fn push(&mut self, report: FileImportReport) {
        // ---
        self.total_imported += report.imported;
        self.total_dropped += report.dropped_dates + report.dropped_outcomes + report.dropped_ids;
        self.total_duplicates += report.duplicates;
        if report.error.is_some() {
            self.failed_files += 1;
        }
        self.files.push(report);
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn read_in_background(path: PathBuf) -> Result<RawSheet, ImportError> {
    // ---
    tokio::task::spawn_blocking(move || read_workbook(&path))
        .await
        .map_err(|e| ImportError::Workbook(e.to_string()))?
}

/// Import spreadsheet files into one site's store.
///
/// Rows whose `(equipment_id, time_tested)` is already stored, or was seen
/// earlier in this import, are skipped.
pub async fn import_files(
    store: &SiteStore,
    paths: &[PathBuf],
    ctx: &TaskContext,
) -> Result<ImportSummary, AuditError> {
    // ---
    let mut seen = store.existing_keys().await?;
    let mut pending = Vec::new();
    let mut summary = ImportSummary::default();
    let total = paths.len();

    for (idx, path) in paths.iter().enumerate() {
        ctx.check()?;
        let file = file_label(path);
        ctx.report(idx + 1, total, format!("Processing {file} ({}/{total})", idx + 1));

        let parsed = match read_in_background(path.clone()).await.and_then(|s| parse_sheet(&s)) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Skipping file {}: {}", file, e);
                summary.push(FileImportReport {
                    file,
                    error: Some(e.to_string()),
                    ..Default::default()
                });
                continue;
            }
        };

        let dropped = parsed.dropped_dates + parsed.dropped_outcomes + parsed.dropped_ids;
        if dropped > 0 {
            warn!(
                "{} rows dropped from '{}' ({} invalid dates, {} unknown outcomes, {} blank ids)",
                dropped, file, parsed.dropped_dates, parsed.dropped_outcomes, parsed.dropped_ids
            );
        }

        let (kept, duplicates) = dedup_events(parsed.events, &mut seen);
        info!("Read {} new records from {} ({} duplicates)", kept.len(), file, duplicates);

        summary.push(FileImportReport {
            file,
            imported: kept.len(),
            dropped_dates: parsed.dropped_dates,
            dropped_outcomes: parsed.dropped_outcomes,
            dropped_ids: parsed.dropped_ids,
            duplicates,
            error: None,
        });
        pending.extend(kept);
    }

    ctx.check()?;
    if !pending.is_empty() {
        ctx.report(total, total, format!("Writing {} records", pending.len()));
        store.insert_events(&pending).await?;
    }

    info!(
        "Import finished: {} records from {} files, {} files skipped",
        summary.total_imported,
        summary.files.len(),
        summary.failed_files
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::DateRange;
    use crate::store::StoreOptions;
    use crate::tasks::spawn_task;

    fn headers() -> Vec<String> {
        COLUMN_MAP.iter().map(|(h, _)| h.to_string()).collect()
    }

    fn text(s: &str) -> RawCell {
        RawCell::Text(s.to_string())
    }

    /// Row with only id, time and outcome filled.
    fn row(id: RawCell, time: RawCell, outcome: &str) -> Vec<RawCell> {
        // ---
        let mut cells = vec![RawCell::Empty; COLUMN_MAP.len()];
        cells[0] = id;
        cells[1] = text("SN-1");
        cells[7] = time;
        cells[9] = RawCell::Number(0.5);
        cells[10] = text(outcome);
        cells
    }

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_excel_serial_origin() {
        // ---
        assert_eq!(excel_serial_to_datetime(45292.0), Some(ts("2024-01-01 00:00:00")));
        assert_eq!(excel_serial_to_datetime(45292.5), Some(ts("2024-01-01 12:00:00")));
        assert_eq!(parse_time_text("45292"), Some(ts("2024-01-01 00:00:00")));
        // Out of the serial window.
        assert_eq!(parse_time_text("95000"), None);
        assert_eq!(parse_time_text("0.5"), None);
    }

    #[test]
    fn test_text_timestamp_formats() {
        // ---
        assert_eq!(parse_time_text("2024-01-01 08:00:30"), Some(ts("2024-01-01 08:00:30")));
        assert_eq!(parse_time_text("2024-01-01T08:00:30"), Some(ts("2024-01-01 08:00:30")));
        assert_eq!(parse_time_text("2024-01-01 08:00"), Some(ts("2024-01-01 08:00:00")));
        assert_eq!(parse_time_text("2024-01-01"), Some(ts("2024-01-01 00:00:00")));
        assert_eq!(parse_time_text("01/02/2024 07:15"), Some(ts("2024-02-01 07:15:00")));
        assert_eq!(parse_time_text("yesterday"), None);
        assert_eq!(
            parse_time_cell(&text("2024-01-01 08:00:30.750")),
            Some(ts("2024-01-01 08:00:30"))
        );
    }

    #[test]
    fn test_parse_sheet_drops_and_counts_bad_rows() {
        // ---
        let sheet = RawSheet {
            headers: headers(),
            rows: vec![
                row(text("E1"), RawCell::Number(45292.25), "PASS"),
                row(text("E2"), RawCell::DateTime(45292.5), " fail "),
                row(RawCell::Number(1001.0), text("2024-01-02 10:00:00"), "Pass"),
                row(text("E3"), text("not a date"), "pass"),
                row(text("E4"), text("2024-01-02 10:00:00"), "inconclusive"),
                row(RawCell::Empty, text("2024-01-02 10:00:00"), "pass"),
                vec![RawCell::Empty; COLUMN_MAP.len()],
            ],
        };
        let parsed = parse_sheet(&sheet).unwrap();

        assert_eq!(parsed.events.len(), 3);
        assert_eq!(parsed.dropped_dates, 1);
        assert_eq!(parsed.dropped_outcomes, 1);
        assert_eq!(parsed.dropped_ids, 1);

        let e1 = &parsed.events[0];
        assert_eq!(e1.time_tested, ts("2024-01-01 06:00:00"));
        assert_eq!(e1.outcome, Outcome::Pass);
        assert_eq!(e1.serial.as_deref(), Some("SN-1"));
        assert_eq!(e1.measured_value, Some(0.5));
        assert_eq!(parsed.events[1].outcome, Outcome::Fail);
        assert_eq!(parsed.events[2].equipment_id, "1001");
    }

    #[test]
    fn test_missing_columns_reject_the_file() {
        // ---
        let mut cols = headers();
        cols.retain(|h| h != "Outcome" && h != "Shift");
        let err = parse_sheet(&RawSheet {
            headers: cols,
            rows: vec![],
        })
        .unwrap_err();

        match err {
            ImportError::MissingColumns(missing) => {
                assert_eq!(missing, vec!["shift".to_string(), "outcome".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_internal_column_names_are_accepted() {
        // ---
        let sheet = RawSheet {
            headers: COLUMN_MAP.iter().map(|(_, i)| i.to_uppercase()).collect(),
            rows: vec![row(text("E1"), text("2024-01-01 08:00:00"), "pass")],
        };
        assert_eq!(parse_sheet(&sheet).unwrap().events.len(), 1);
    }

    fn write_fixture(path: &Path, rows: &[(&str, &str, &str)]) {
        // ---
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        for (col, header) in headers().iter().enumerate() {
            sheet.write_string(0, col as u16, header.as_str()).unwrap();
        }
        for (i, (id, time, outcome)) in rows.iter().enumerate() {
            let r = i as u32 + 1;
            sheet.write_string(r, 0, *id).unwrap();
            sheet.write_string(r, 1, "SN-9").unwrap();
            sheet.write_string(r, 7, *time).unwrap();
            sheet.write_number(r, 9, 1.5).unwrap();
            sheet.write_string(r, 10, *outcome).unwrap();
        }
        workbook.save(path).unwrap();
    }

    #[test]
    fn test_read_workbook_round_trips_fixture() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tests.xlsx");
        write_fixture(&path, &[("E1", "2024-01-01 08:00:00", "pass")]);

        let sheet = read_workbook(&path).unwrap();
        assert_eq!(sheet.headers, headers());
        assert_eq!(sheet.rows.len(), 1);
        assert_eq!(sheet.rows[0][9], RawCell::Number(1.5));
    }

    #[tokio::test]
    async fn test_import_deduplicates_within_and_across_files() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.xlsx");
        let second = dir.path().join("b.xlsx");
        let broken = dir.path().join("broken.xlsx");
        write_fixture(
            &first,
            &[
                ("E1", "2024-01-01 08:00:00", "pass"),
                ("E1", "2024-01-01 08:00:00", "fail"),
                ("E1", "2024-01-01 08:00:30", "fail"),
            ],
        );
        write_fixture(
            &second,
            &[
                ("E1", "2024-01-01 08:00:30", "pass"),
                ("E2", "2024-01-01 09:15:00", "pass"),
            ],
        );
        std::fs::write(&broken, b"not a workbook").unwrap();

        let store = SiteStore::open(&dir.path().join("site.db"), &StoreOptions::default())
            .await
            .unwrap();
        let paths = vec![first.clone(), broken, second.clone()];
        let task_store = store.clone();
        let summary = spawn_task("import", move |ctx| async move {
            import_files(&task_store, &paths, &ctx).await
        })
        .join()
        .await
        .unwrap();

        assert_eq!(summary.total_imported, 3);
        assert_eq!(summary.total_duplicates, 2);
        assert_eq!(summary.failed_files, 1);
        assert!(summary.files[1].error.is_some());

        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );
        let stored = store.events_between(&range).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].outcome, Outcome::Pass);

        // Importing the same file again stores nothing new.
        let again = vec![first];
        let task_store = store.clone();
        let summary = spawn_task("import", move |ctx| async move {
            import_files(&task_store, &again, &ctx).await
        })
        .join()
        .await
        .unwrap();
        assert_eq!(summary.total_imported, 0);
        assert_eq!(store.all_events().await.unwrap().len(), 3);
    }
}
