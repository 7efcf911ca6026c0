//! Per-site SQLite store: test events and equipment notes.
//!
//! One database file per site. Connections wait up to the configured busy
//! timeout for a lock instead of failing immediately on contention.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteConnection;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::models::{
    DateRange, EquipmentNote, EventKey, NewNote, TestEvent, DATETIME_FORMAT, DATE_FORMAT,
};
use crate::reports::{top_tested_equipment, DatabaseStats, OutcomeCount};
use crate::schema;

// ---

/// Connection settings shared by every site store.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    // ---
    pub busy_timeout: Duration,
    pub pool_max: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            busy_timeout: Duration::from_secs(10),
            pool_max: 1,
        }
    }
}

/// Handle on one site's database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SiteStore {
    // ---
    pool: SqlitePool,
    path: PathBuf,
}

#[derive(sqlx::FromRow)]
struct TestEventRow {
    // ---
    equipment_id: Option<String>,
    serial: Option<String>,
    equipment_type: Option<String>,
    employee_id: Option<String>,
    technician_name: Option<String>,
    section: Option<String>,
    shift: Option<String>,
    time_tested: Option<String>,
    gas_type: Option<String>,
    measured_value: Option<f64>,
    outcome: Option<String>,
}

impl TestEventRow {
    /// `None` when the id, timestamp or outcome cannot be interpreted.
    fn into_event(self) -> Option<TestEvent> {
        // ---
        let equipment_id = self.equipment_id.filter(|id| !id.trim().is_empty())?;
        let time_tested = parse_stored_timestamp(self.time_tested.as_deref()?)?;
        let outcome = self.outcome.as_deref()?.parse().ok()?;
        Some(TestEvent {
            equipment_id,
            serial: self.serial,
            equipment_type: self.equipment_type,
            employee_id: self.employee_id,
            technician_name: self.technician_name,
            section: self.section,
            shift: self.shift,
            time_tested,
            gas_type: self.gas_type,
            measured_value: self.measured_value,
            outcome,
        })
    }
}

const SELECT_EVENTS: &str = r#"
    SELECT equipment_id, serial, equipment_type, employee_id, technician_name,
           section, shift, CAST(time_tested AS TEXT) AS time_tested, gas_type,
           measured_value, outcome
    FROM sensor_tests
"#;

fn parse_stored_timestamp(raw: &str) -> Option<NaiveDateTime> {
    // ---
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

fn rows_to_events(rows: Vec<TestEventRow>) -> Vec<TestEvent> {
    // ---
    let total = rows.len();
    let events: Vec<TestEvent> = rows.into_iter().filter_map(TestEventRow::into_event).collect();
    if events.len() < total {
        warn!(
            "Excluded {} stored rows with unreadable id, timestamp or outcome",
            total - events.len()
        );
    }
    events
}

async fn insert_event(conn: &mut SqliteConnection, event: &TestEvent) -> Result<(), sqlx::Error> {
    // ---
    sqlx::query(
        r#"
        INSERT INTO sensor_tests (
            equipment_id, serial, equipment_type, employee_id,
            technician_name, section, shift, time_tested, gas_type,
            measured_value, outcome
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.equipment_id)
    .bind(&event.serial)
    .bind(&event.equipment_type)
    .bind(&event.employee_id)
    .bind(&event.technician_name)
    .bind(&event.section)
    .bind(&event.shift)
    .bind(event.time_tested.format(DATETIME_FORMAT).to_string())
    .bind(&event.gas_type)
    .bind(event.measured_value)
    .bind(event.outcome.as_str())
    .execute(conn)
    .await?;

    Ok(())
}

impl SiteStore {
    // ---
    /// Open a site database, creating the file and schema if needed.
    pub async fn open(path: &Path, options: &StoreOptions) -> Result<Self, StoreError> {
        Self::connect(path, options, true).await
    }

    /// Open a site database that must already exist on disk.
    pub async fn open_existing(path: &Path, options: &StoreOptions) -> Result<Self, StoreError> {
        // ---
        if !path.exists() {
            return Err(StoreError::Missing(path.to_path_buf()));
        }
        Self::connect(path, options, false).await
    }

    async fn connect(path: &Path, options: &StoreOptions, create: bool) -> Result<Self, StoreError> {
        // ---
        debug!("Opening site database {}", path.display());

        let connect_opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.pool_max.max(1))
            .acquire_timeout(options.busy_timeout)
            .connect_with(connect_opts)
            .await?;

        schema::create_schema(&pool).await?;

        Ok(SiteStore {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert events in a single transaction; on failure the transaction is
    /// rolled back before the error is returned.
    pub async fn insert_events(&self, events: &[TestEvent]) -> Result<u64, StoreError> {
        // ---
        let mut tx = self.pool.begin().await?;
        for event in events {
            if let Err(e) = insert_event(&mut tx, event).await {
                error!("Insert failed, rolling back {} events: {}", events.len(), e);
                if let Err(rollback) = tx.rollback().await {
                    error!("Rollback failed: {}", rollback);
                }
                return Err(e.into());
            }
        }
        tx.commit().await?;

        info!("Inserted {} events into {}", events.len(), self.path.display());
        Ok(events.len() as u64)
    }

    /// Events whose date lies in `range`, in insertion order.
    pub async fn events_between(&self, range: &DateRange) -> Result<Vec<TestEvent>, StoreError> {
        // ---
        let sql = format!(
            "{SELECT_EVENTS} WHERE DATE(time_tested) BETWEEN DATE(?) AND DATE(?) ORDER BY id"
        );
        let rows: Vec<TestEventRow> = sqlx::query_as(&sql)
            .bind(range.from.format(DATE_FORMAT).to_string())
            .bind(range.to.format(DATE_FORMAT).to_string())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows_to_events(rows))
    }

    pub async fn all_events(&self) -> Result<Vec<TestEvent>, StoreError> {
        // ---
        let sql = format!("{SELECT_EVENTS} ORDER BY id");
        let rows: Vec<TestEventRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows_to_events(rows))
    }

    /// Every stored `(equipment_id, time_tested)` pair.
    pub async fn existing_keys(&self) -> Result<HashSet<EventKey>, StoreError> {
        // ---
        let rows: Vec<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT equipment_id, CAST(time_tested AS TEXT) FROM sensor_tests",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, ts)| Some((id?, parse_stored_timestamp(ts.as_deref()?)?)))
            .collect())
    }

    /// Delete every test event and note for this site.
    pub async fn reset(&self) -> Result<u64, StoreError> {
        // ---
        let mut tx = self.pool.begin().await?;
        let tests = sqlx::query("DELETE FROM sensor_tests")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let notes = sqlx::query("DELETE FROM equipment_notes")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        info!(
            "Reset {}: removed {} tests and {} notes",
            self.path.display(),
            tests,
            notes
        );
        Ok(tests + notes)
    }

    // --- notes

    pub async fn add_note(&self, note: &NewNote) -> Result<i64, StoreError> {
        // ---
        let text = note.note_text.trim();
        if text.is_empty() {
            return Err(StoreError::EmptyNote);
        }
        let author = note
            .created_by
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty());

        let id = sqlx::query(
            "INSERT INTO equipment_notes (equipment_id, note_text, created_by) VALUES (?, ?, ?)",
        )
        .bind(&note.equipment_id)
        .bind(text)
        .bind(author)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        info!(
            "Note added for {} by {}",
            note.equipment_id,
            author.unwrap_or("Anonymous")
        );
        Ok(id)
    }

    /// Notes for one equipment id, newest first.
    pub async fn notes_for(&self, equipment_id: &str) -> Result<Vec<EquipmentNote>, StoreError> {
        // ---
        let notes = sqlx::query_as::<_, EquipmentNote>(
            r#"
            SELECT id, equipment_id, note_text, created_date, created_by
            FROM equipment_notes
            WHERE equipment_id = ?
            ORDER BY created_date DESC, id DESC
            "#,
        )
        .bind(equipment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(notes)
    }

    /// Delete the most recent note whose text matches exactly.
    ///
    /// Returns the number of rows removed; `0` when nothing matched.
    pub async fn delete_note(&self, equipment_id: &str, note_text: &str) -> Result<u64, StoreError> {
        // ---
        let affected = sqlx::query(
            r#"
            DELETE FROM equipment_notes
            WHERE id = (
                SELECT id FROM equipment_notes
                WHERE equipment_id = ? AND note_text = ?
                ORDER BY created_date DESC, id DESC
                LIMIT 1
            )
            "#,
        )
        .bind(equipment_id)
        .bind(note_text)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            debug!("No note matched for {}, nothing deleted", equipment_id);
        } else {
            info!("Note deleted for {}", equipment_id);
        }
        Ok(affected)
    }

    pub async fn equipment_with_notes(&self) -> Result<HashSet<String>, StoreError> {
        // ---
        let ids: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT equipment_id FROM equipment_notes")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    // --- statistics

    pub async fn database_stats(&self, site: &str) -> Result<DatabaseStats, StoreError> {
        // ---
        let (total_records,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sensor_tests")
            .fetch_one(&self.pool)
            .await?;

        let (first, last): (Option<String>, Option<String>) = sqlx::query_as(
            "SELECT MIN(DATE(time_tested)), MAX(DATE(time_tested)) FROM sensor_tests",
        )
        .fetch_one(&self.pool)
        .await?;

        let (unique_equipment,): (i64,) =
            sqlx::query_as("SELECT COUNT(DISTINCT equipment_id) FROM sensor_tests")
                .fetch_one(&self.pool)
                .await?;

        let (equipment_with_notes,): (i64,) =
            sqlx::query_as("SELECT COUNT(DISTINCT equipment_id) FROM equipment_notes")
                .fetch_one(&self.pool)
                .await?;

        let (total_notes,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM equipment_notes")
            .fetch_one(&self.pool)
            .await?;

        let outcome_rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT COALESCE(outcome, '') AS outcome, COUNT(*) AS n
            FROM sensor_tests
            GROUP BY outcome
            ORDER BY outcome
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let size_bytes = tokio::fs::metadata(&self.path).await?.len();
        let total = total_records.max(0) as u64;

        let outcomes = outcome_rows
            .into_iter()
            .map(|(outcome, n)| {
                let count = n.max(0) as u64;
                let percentage = if total > 0 {
                    count as f64 / total as f64 * 100.0
                } else {
                    0.0
                };
                OutcomeCount {
                    outcome,
                    count,
                    percentage,
                }
            })
            .collect();

        let parse_date = |raw: Option<String>| {
            raw.and_then(|d| NaiveDate::parse_from_str(&d, DATE_FORMAT).ok())
        };

        let top_tested = top_tested_equipment(&self.all_events().await?, 5);

        Ok(DatabaseStats {
            site: site.to_string(),
            total_records: total,
            unique_equipment: unique_equipment.max(0) as u64,
            first_date: parse_date(first),
            last_date: parse_date(last),
            size_mb: size_bytes as f64 / (1024.0 * 1024.0),
            equipment_with_notes: equipment_with_notes.max(0) as u64,
            total_notes: total_notes.max(0) as u64,
            outcomes,
            top_tested,
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::Outcome;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, DATETIME_FORMAT).unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    async fn temp_store() -> (tempfile::TempDir, SiteStore) {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let store = SiteStore::open(&dir.path().join("site.db"), &StoreOptions::default())
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_insert_and_query_by_date() {
        // ---
        let (_dir, store) = temp_store().await;
        let events = vec![
            TestEvent::new("E1", ts("2024-01-01 08:00:00"), Outcome::Pass).with_serial("S1"),
            TestEvent::new("E1", ts("2024-01-02 23:59:59"), Outcome::Fail),
            TestEvent::new("E2", ts("2024-01-03 00:00:00"), Outcome::Pass),
        ];
        assert_eq!(store.insert_events(&events).await.unwrap(), 3);

        let found = store
            .events_between(&DateRange::new(day(1), day(2)))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], events[0]);
        assert_eq!(found[1].outcome, Outcome::Fail);

        let keys = store.existing_keys().await.unwrap();
        assert!(keys.contains(&("E2".to_string(), ts("2024-01-03 00:00:00"))));
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn test_unreadable_rows_are_excluded() {
        // ---
        let (_dir, store) = temp_store().await;
        sqlx::query(
            "INSERT INTO sensor_tests (equipment_id, time_tested, outcome) VALUES ('E9', 'garbage', 'pass')",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        store
            .insert_events(&[TestEvent::new("E1", ts("2024-01-01 08:00:00"), Outcome::Pass)])
            .await
            .unwrap();

        let all = store.all_events().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].equipment_id, "E1");
    }

    #[tokio::test]
    async fn test_note_lifecycle() {
        // ---
        let (_dir, store) = temp_store().await;
        let note = |text: &str| NewNote {
            equipment_id: "E1".into(),
            note_text: text.into(),
            created_by: Some("Thabo".into()),
        };

        store.add_note(&note("sensor replaced")).await.unwrap();
        store.add_note(&note("sensor replaced")).await.unwrap();
        store.add_note(&note("bump test ok")).await.unwrap();
        assert!(matches!(
            store.add_note(&note("   ")).await,
            Err(StoreError::EmptyNote)
        ));

        let notes = store.notes_for("E1").await.unwrap();
        assert_eq!(notes.len(), 3);
        assert_eq!(notes[0].note_text, "bump test ok");

        // Non-matching text is a no-op.
        assert_eq!(store.delete_note("E1", "sensor").await.unwrap(), 0);
        assert_eq!(store.delete_note("E2", "bump test ok").await.unwrap(), 0);

        // Only the most recent exact match is removed.
        assert_eq!(store.delete_note("E1", "sensor replaced").await.unwrap(), 1);
        let remaining = store.notes_for("E1").await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(|n| n.note_text == "sensor replaced"));

        let noted = store.equipment_with_notes().await.unwrap();
        assert!(noted.contains("E1"));
        assert_eq!(noted.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_and_stats() {
        // ---
        let (_dir, store) = temp_store().await;
        store
            .insert_events(&[
                TestEvent::new("E1", ts("2024-01-01 08:00:00"), Outcome::Pass),
                TestEvent::new("E1", ts("2024-01-02 08:00:00"), Outcome::Fail),
                TestEvent::new("E2", ts("2024-01-02 09:00:00"), Outcome::Pass),
            ])
            .await
            .unwrap();

        let stats = store.database_stats("K3").await.unwrap();
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.unique_equipment, 2);
        assert_eq!(stats.first_date, Some(day(1)));
        assert_eq!(stats.last_date, Some(day(2)));
        assert_eq!(stats.outcomes.len(), 2);
        assert_eq!(stats.outcomes[0].outcome, "fail");
        assert_eq!(stats.top_tested[0].equipment_id, "E1");
        assert_eq!(stats.top_tested[0].test_days, 2);

        assert_eq!(store.reset().await.unwrap(), 3);
        assert!(store.all_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_existing_refuses_missing_file() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.db");
        let err = SiteStore::open_existing(&missing, &StoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Missing(_)));
        assert!(!missing.exists());
    }
}
