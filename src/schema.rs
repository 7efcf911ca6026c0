//! Database schema management for the per-site SQLite stores.
//!
//! Ensures required tables and indexes exist before a site is queried.
//! Applied every time a site store is opened (EMBP: single gateway call).

use sqlx::SqlitePool;

// ---

/// Create or update the site schema (idempotent).
///
/// Creates the `sensor_tests` table for raw test events and the
/// `equipment_notes` table for free-text notes. Safe to call on every open;
/// no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // ---
    let mut tx = pool.begin().await?;

    // Raw test events; `time_tested` is stored as `%Y-%m-%d %H:%M:%S` text
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_tests (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            equipment_id    TEXT,
            serial          TEXT,
            equipment_type  TEXT,
            employee_id     TEXT,
            technician_name TEXT,
            section         TEXT,
            shift           TEXT,
            time_tested     DATETIME,
            gas_type        TEXT,
            measured_value  REAL,
            outcome         TEXT
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Notes reference equipment by identity only, not by test row
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS equipment_notes (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            equipment_id TEXT NOT NULL,
            note_text    TEXT NOT NULL,
            created_date DATETIME DEFAULT CURRENT_TIMESTAMP,
            created_by   TEXT
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    for index in [
        "CREATE INDEX IF NOT EXISTS idx_time_tested ON sensor_tests (time_tested);",
        "CREATE INDEX IF NOT EXISTS idx_equipment_id ON sensor_tests (equipment_id);",
        "CREATE INDEX IF NOT EXISTS idx_outcome ON sensor_tests (outcome);",
        "CREATE INDEX IF NOT EXISTS idx_notes_equipment_id ON equipment_notes (equipment_id);",
        "CREATE INDEX IF NOT EXISTS idx_notes_date ON equipment_notes (created_date);",
    ] {
        sqlx::query(index).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}
