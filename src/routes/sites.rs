//! Site registry endpoints, the per-site reset and the cache reset.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{ApiError, ApiResult};
use crate::service::{Mutation, SiteInfo};
use crate::AuditService;

// ---

pub fn router() -> Router<AuditService> {
    // ---
    Router::new()
        .route("/sites", get(list_sites).post(add_site))
        .route("/sites/{site}", delete(remove_site))
        .route("/sites/{site}/reset", post(reset_site))
        .route("/cache/invalidate", post(invalidate_cache))
}

#[derive(Debug, Deserialize)]
struct NewSite {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct RemoveQuery {
    #[serde(default)]
    delete_data: bool,
}

async fn list_sites(State(service): State<AuditService>) -> Json<Vec<SiteInfo>> {
    Json(service.sites().await)
}

async fn add_site(
    State(service): State<AuditService>,
    Json(body): Json<NewSite>,
) -> Result<(StatusCode, Json<SiteInfo>), ApiError> {
    // ---
    info!("POST /sites - {}", body.name);
    let site = service.add_site(&body.name).await?;
    Ok((StatusCode::CREATED, Json(site)))
}

async fn remove_site(
    State(service): State<AuditService>,
    Path(site): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> ApiResult<Mutation> {
    // ---
    info!("DELETE /sites/{} (delete_data={})", site, query.delete_data);
    Ok(Json(service.remove_site(&site, query.delete_data).await?))
}

async fn reset_site(
    State(service): State<AuditService>,
    Path(site): Path<String>,
) -> ApiResult<Mutation> {
    // ---
    info!("POST /sites/{}/reset", site);
    Ok(Json(service.reset(&site).await?))
}

/// Clear the memoized dashboard after out-of-band data changes.
async fn invalidate_cache(State(service): State<AuditService>) -> Json<Value> {
    Json(json!({ "invalidated": service.invalidate_cache() }))
}
