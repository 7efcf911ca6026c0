//! Data models for the gas-detector test audit pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{Duration, Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

// ---

/// Storage and export format for test timestamps.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Storage format for calendar dates.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Result of a single calibration check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    // ---
    Pass,
    Fail,
}

impl Outcome {
    // ---
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pass => "pass",
            Outcome::Fail => "fail",
        }
    }

    /// Combine two outcomes of the same bucket: any failure wins.
    pub fn merge(self, other: Outcome) -> Outcome {
        // ---
        if self == Outcome::Fail || other == Outcome::Fail {
            Outcome::Fail
        } else {
            Outcome::Pass
        }
    }

    pub fn is_fail(&self) -> bool {
        *self == Outcome::Fail
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when an outcome cell holds neither `pass` nor `fail`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized outcome '{0}'")]
pub struct UnknownOutcome(pub String);

impl FromStr for Outcome {
    type Err = UnknownOutcome;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s.trim().to_ascii_lowercase().as_str() {
            "pass" => Ok(Outcome::Pass),
            "fail" => Ok(Outcome::Fail),
            _ => Err(UnknownOutcome(s.to_string())),
        }
    }
}

/// One stored sensor test. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEvent {
    // ---
    pub equipment_id: String,
    pub serial: Option<String>,
    pub equipment_type: Option<String>,
    pub employee_id: Option<String>,
    pub technician_name: Option<String>,
    pub section: Option<String>,
    pub shift: Option<String>,
    pub time_tested: NaiveDateTime,
    pub gas_type: Option<String>,
    pub measured_value: Option<f64>,
    pub outcome: Outcome,
}

impl TestEvent {
    // ---
    pub fn new(equipment_id: impl Into<String>, time_tested: NaiveDateTime, outcome: Outcome) -> Self {
        TestEvent {
            equipment_id: equipment_id.into(),
            serial: None,
            equipment_type: None,
            employee_id: None,
            technician_name: None,
            section: None,
            shift: None,
            time_tested,
            gas_type: None,
            measured_value: None,
            outcome,
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Identity used for ingestion de-duplication.
    pub fn key(&self) -> EventKey {
        (self.equipment_id.clone(), self.time_tested)
    }
}

/// `(equipment_id, time_tested)`: at most one stored event per key.
pub type EventKey = (String, NaiveDateTime);

/// A free-text note attached to a piece of equipment.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct EquipmentNote {
    // ---
    pub id: i64,
    pub equipment_id: String,
    pub note_text: String,
    pub created_date: NaiveDateTime,
    pub created_by: Option<String>,
}

/// Payload for creating a note.
#[derive(Debug, Clone, Deserialize)]
pub struct NewNote {
    // ---
    pub equipment_id: String,
    pub note_text: String,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// Closed date interval; only the date component of a timestamp is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    // ---
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    // ---
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        DateRange { from, to }
    }

    /// The `days` days leading up to and including today.
    pub fn last_days(days: u32) -> Self {
        // ---
        let to = Local::now().date_naive();
        let from = to - Duration::days(i64::from(days));
        DateRange { from, to }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to {}",
            self.from.format(DATE_FORMAT),
            self.to.format(DATE_FORMAT)
        )
    }
}
