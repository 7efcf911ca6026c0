//! HTTP gateway (EMBP): merges one subrouter per concern and maps typed
//! errors to status codes. Handlers only translate between HTTP and the
//! [`AuditService`]; no aggregation happens here.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::error::{AuditError, ConfigError, ExportError, ImportError, StoreError};
use crate::models::DateRange;
use crate::tasks::TaskHandle;
use crate::AuditService;

mod dashboard;
mod health;
mod notes;
mod reports;
mod sites;
mod transfer;

// ---

pub fn router(service: AuditService) -> Router {
    // ---
    Router::new()
        .merge(health::router())
        .merge(sites::router())
        .merge(dashboard::router())
        .merge(notes::router())
        .merge(transfer::router())
        .merge(reports::router())
        .with_state(service)
}

/// Error body returned by every handler: `{ "error": "..." }`.
#[derive(Debug)]
pub struct ApiError {
    // ---
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn config_status(err: &ConfigError) -> StatusCode {
    // ---
    match err {
        ConfigError::NoSiteSelected | ConfigError::EmptySiteName => StatusCode::BAD_REQUEST,
        ConfigError::UnknownSite(_) => StatusCode::NOT_FOUND,
        ConfigError::SiteExists(_) => StatusCode::CONFLICT,
        ConfigError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        // ---
        let status = match &err {
            AuditError::Config(e) => config_status(e),
            AuditError::Store(StoreError::EmptyNote) => StatusCode::BAD_REQUEST,
            AuditError::Store(StoreError::Missing(_)) => StatusCode::NOT_FOUND,
            AuditError::Import(ImportError::MissingColumns(_))
            | AuditError::Import(ImportError::EmptyWorkbook) => StatusCode::UNPROCESSABLE_ENTITY,
            AuditError::Export(ExportError::NoData) => StatusCode::UNPROCESSABLE_ENTITY,
            AuditError::Cancelled => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("Request failed: {}", err);
        } else {
            warn!("Request rejected ({}): {}", status, err);
        }
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// `from`/`to` query parameters; either may be omitted.
#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    // ---
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl RangeQuery {
    /// Fill missing bounds from the service's default window.
    pub fn resolve(&self, service: &AuditService) -> Result<DateRange, ApiError> {
        // ---
        resolve_range(self.from, self.to, service)
    }
}

pub fn resolve_range(
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    service: &AuditService,
) -> Result<DateRange, ApiError> {
    // ---
    let default = service.default_range();
    let range = DateRange::new(from.unwrap_or(default.from), to.unwrap_or(default.to));
    if range.from > range.to {
        return Err(ApiError::bad_request(format!(
            "'from' ({}) is after 'to' ({})",
            range.from, range.to
        )));
    }
    Ok(range)
}

/// Wait for a background task on behalf of a request.
///
/// If the client disconnects first, the handler future is dropped and the
/// guard cancels the task.
pub async fn finish<T>(handle: TaskHandle<T>) -> Result<T, ApiError> {
    // ---
    info!("Waiting on task {} ({})", handle.name(), handle.id());
    let guard = handle.cancel_on_drop();
    let result = handle.join().await;
    let _ = guard.disarm();
    Ok(result?)
}
