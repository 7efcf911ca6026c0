//! Cross-site reports. Sites whose database cannot be opened are skipped.

use std::path::PathBuf;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::info;

use super::{finish, resolve_range, ApiResult, RangeQuery};
use crate::reports::{ConsolidatedFailureRow, SiteDailyAggregate};
use crate::service::FailCountExport;
use crate::AuditService;

// ---

pub fn router() -> Router<AuditService> {
    // ---
    Router::new()
        .route("/reports/trend", get(trend))
        .route("/reports/failure-ranking", get(failure_ranking))
        .route("/reports/fail-count-export", post(fail_count_export))
}

#[derive(Debug, Deserialize)]
struct FailCountRequest {
    path: PathBuf,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

async fn trend(
    State(service): State<AuditService>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Vec<SiteDailyAggregate>> {
    // ---
    let range = query.resolve(&service)?;
    info!("GET /reports/trend ({})", range);
    Ok(Json(finish(service.consolidated_trend(range)).await?))
}

async fn failure_ranking(
    State(service): State<AuditService>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Vec<ConsolidatedFailureRow>> {
    // ---
    let range = query.resolve(&service)?;
    info!("GET /reports/failure-ranking ({})", range);
    Ok(Json(finish(service.consolidated_ranking(range)).await?))
}

async fn fail_count_export(
    State(service): State<AuditService>,
    Json(request): Json<FailCountRequest>,
) -> ApiResult<FailCountExport> {
    // ---
    let range = resolve_range(request.from, request.to, &service)?;
    info!("POST /reports/fail-count-export -> {}", request.path.display());
    let handle = service.export_fail_count_report(range, request.path);
    Ok(Json(finish(handle).await?))
}
