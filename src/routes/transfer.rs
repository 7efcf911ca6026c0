//! Spreadsheet import and dashboard export for one site.
//!
//! Both run as background tasks; the handler waits for completion so the
//! response carries the final summary.

use std::path::PathBuf;

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{finish, resolve_range, ApiError, ApiResult};
use crate::export::ExportFormat;
use crate::import::ImportSummary;
use crate::AuditService;

// ---

pub fn router() -> Router<AuditService> {
    // ---
    Router::new()
        .route("/sites/{site}/import", post(import))
        .route("/sites/{site}/export", post(export))
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    files: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ImportResponse {
    // ---
    #[serde(flatten)]
    summary: ImportSummary,
    cache_invalidated: bool,
}

#[derive(Debug, Deserialize)]
struct ExportRequest {
    // ---
    path: PathBuf,
    format: Option<ExportFormat>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    search: Option<String>,
}

#[derive(Debug, Serialize)]
struct ExportResponse {
    path: PathBuf,
    rows_written: usize,
}

async fn import(
    State(service): State<AuditService>,
    Path(site): Path<String>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<ImportResponse> {
    // ---
    if request.files.is_empty() {
        return Err(ApiError::bad_request("no files given"));
    }
    info!("POST /sites/{}/import - {} file(s)", site, request.files.len());

    let handle = service.import_files(&site, request.files).await?;
    let summary = finish(handle).await?;
    Ok(Json(ImportResponse {
        summary,
        cache_invalidated: true,
    }))
}

async fn export(
    State(service): State<AuditService>,
    Path(site): Path<String>,
    Json(request): Json<ExportRequest>,
) -> ApiResult<ExportResponse> {
    // ---
    let range = resolve_range(request.from, request.to, &service)?;
    info!("POST /sites/{}/export -> {}", site, request.path.display());

    let handle = service
        .export_dashboard(
            &site,
            range,
            request.path.clone(),
            request.format,
            request.search,
        )
        .await?;
    let rows_written = finish(handle).await?;
    Ok(Json(ExportResponse {
        path: request.path,
        rows_written,
    }))
}
