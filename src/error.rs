//! Error taxonomy for the audit core.
//!
//! Each layer owns a typed error; `AuditError` is what the service facade and
//! background tasks hand back to the presentation layer.

use std::path::PathBuf;

use thiserror::Error;

// ---

/// Site selection and registry problems. Never fatal to the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    // ---
    #[error("no site selected")]
    NoSiteSelected,

    #[error("unknown site '{0}'")]
    UnknownSite(String),

    #[error("site '{0}' already exists")]
    SiteExists(String),

    #[error("site name must not be empty")]
    EmptySiteName,

    #[error("site registry error: {0}")]
    Registry(String),
}

/// Per-site database failures. Site selection problems never get this
/// far; they surface as [`ConfigError`] before a store is opened.
#[derive(Debug, Error)]
pub enum StoreError {
    // ---
    #[error("database file not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("note text must not be empty")]
    EmptyNote,

    #[error("storage error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// File-level import failures; the file is skipped, the import continues.
#[derive(Debug, Error)]
pub enum ImportError {
    // ---
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("cannot read workbook: {0}")]
    Workbook(String),

    #[error("workbook contains no worksheet")]
    EmptyWorkbook,
}

#[derive(Debug, Error)]
pub enum ExportError {
    // ---
    #[error("no data to export in the selected date range")]
    NoData,

    #[error("spreadsheet write failed: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),

    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Umbrella error returned by the service facade and its background tasks.
#[derive(Debug, Error)]
pub enum AuditError {
    // ---
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("background task failed: {0}")]
    Aborted(String),
}

impl AuditError {
    /// True when the failure is a site selection problem rather than a fault.
    pub fn is_selection_error(&self) -> bool {
        // ---
        matches!(self, AuditError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_selection_errors_are_distinguished_from_faults() {
        // ---
        let no_site: AuditError = ConfigError::NoSiteSelected.into();
        assert!(no_site.is_selection_error());
        assert_eq!(no_site.to_string(), "no site selected");

        let unknown: AuditError = ConfigError::UnknownSite("Atlantis".into()).into();
        assert!(unknown.is_selection_error());

        let fault: AuditError = StoreError::Missing(PathBuf::from("sentinel_k3.db")).into();
        assert!(!fault.is_selection_error());
    }

    #[test]
    fn test_missing_columns_message_lists_columns() {
        // ---
        let err = ImportError::MissingColumns(vec!["serial".into(), "outcome".into()]);
        assert_eq!(err.to_string(), "missing required columns: serial, outcome");
    }
}
