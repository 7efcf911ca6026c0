//! Single-site views: the pass/fail dashboard and the analyses derived from
//! the same collapsed days.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{resolve_range, ApiError, ApiResult, RangeQuery};
use crate::metrics::{DailyAggregate, DayMetrics};
use crate::models::DateRange;
use crate::pivot::TableRow;
use crate::reports::{CommonFailures, DatabaseStats, IntervalCount, SiteFailureRow};
use crate::AuditService;

// ---

pub fn router() -> Router<AuditService> {
    // ---
    Router::new()
        .route("/sites/{site}/dashboard", get(dashboard))
        .route("/sites/{site}/daily", get(daily))
        .route("/sites/{site}/common-failures", get(common_failures))
        .route("/sites/{site}/intervals", get(intervals))
        .route("/sites/{site}/failure-ranking", get(failure_ranking))
        .route("/sites/{site}/stats", get(stats))
}

#[derive(Debug, Default, Deserialize)]
struct DashboardQuery {
    // ---
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    search: Option<String>,
    sort: Option<String>,
    #[serde(default)]
    desc: bool,
    /// Bypass the memoized matrix.
    #[serde(default)]
    fresh: bool,
}

#[derive(Debug, Serialize)]
struct DashboardResponse {
    // ---
    site: String,
    range: DateRange,
    from_cache: bool,
    columns: Vec<String>,
    rows: Vec<TableRow>,
    metrics: Vec<DayMetrics>,
}

async fn dashboard(
    State(service): State<AuditService>,
    Path(site): Path<String>,
    Query(query): Query<DashboardQuery>,
) -> ApiResult<DashboardResponse> {
    // ---
    let range = resolve_range(query.from, query.to, &service)?;
    info!("GET /sites/{}/dashboard ({})", site, range);

    let dashboard = service.dashboard(&site, range, !query.fresh).await?;
    let mut table = match query.search.as_deref() {
        Some(needle) => dashboard.table().filter(needle),
        None => dashboard.table(),
    };
    if let Some(column) = query.sort.as_deref() {
        if !table.sort_by_column(column, query.desc) {
            return Err(ApiError::bad_request(format!("unknown column '{column}'")));
        }
    }

    Ok(Json(DashboardResponse {
        site: dashboard.site,
        range: dashboard.range,
        from_cache: dashboard.from_cache,
        columns: table.columns,
        rows: table.rows,
        metrics: dashboard.matrix.metrics.clone(),
    }))
}

async fn daily(
    State(service): State<AuditService>,
    Path(site): Path<String>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Vec<DailyAggregate>> {
    let range = query.resolve(&service)?;
    Ok(Json(service.daily_series(&site, range).await?))
}

async fn common_failures(
    State(service): State<AuditService>,
    Path(site): Path<String>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<CommonFailures> {
    let range = query.resolve(&service)?;
    Ok(Json(service.common_failures(&site, range).await?))
}

async fn intervals(
    State(service): State<AuditService>,
    Path(site): Path<String>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Vec<IntervalCount>> {
    let range = query.resolve(&service)?;
    Ok(Json(service.interval_counts(&site, range).await?))
}

async fn failure_ranking(
    State(service): State<AuditService>,
    Path(site): Path<String>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Vec<SiteFailureRow>> {
    let range = query.resolve(&service)?;
    Ok(Json(service.site_failure_ranking(&site, range).await?))
}

async fn stats(
    State(service): State<AuditService>,
    Path(site): Path<String>,
) -> ApiResult<DatabaseStats> {
    Ok(Json(service.database_stats(&site).await?))
}
