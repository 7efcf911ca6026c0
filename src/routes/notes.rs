//! Free-text notes attached to equipment.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tracing::info;

use super::{ApiError, ApiResult};
use crate::models::{EquipmentNote, NewNote};
use crate::service::Mutation;
use crate::AuditService;

// ---

pub fn router() -> Router<AuditService> {
    // ---
    Router::new().route(
        "/sites/{site}/notes/{equipment_id}",
        get(list_notes).post(add_note).delete(delete_note),
    )
}

#[derive(Debug, Deserialize)]
struct NoteBody {
    note_text: String,
    created_by: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteBody {
    note_text: String,
}

async fn list_notes(
    State(service): State<AuditService>,
    Path((site, equipment_id)): Path<(String, String)>,
) -> ApiResult<Vec<EquipmentNote>> {
    Ok(Json(service.notes(&site, &equipment_id).await?))
}

async fn add_note(
    State(service): State<AuditService>,
    Path((site, equipment_id)): Path<(String, String)>,
    Json(body): Json<NoteBody>,
) -> Result<(StatusCode, Json<Mutation>), ApiError> {
    // ---
    info!("POST note for {} at {}", equipment_id, site);
    let note = NewNote {
        equipment_id,
        note_text: body.note_text,
        created_by: body.created_by,
    };
    let mutation = service.add_note(&site, &note).await?;
    Ok((StatusCode::CREATED, Json(mutation)))
}

/// Removes the most recent note with exactly this text.
async fn delete_note(
    State(service): State<AuditService>,
    Path((site, equipment_id)): Path<(String, String)>,
    Json(body): Json<DeleteBody>,
) -> ApiResult<Mutation> {
    // ---
    info!("DELETE note for {} at {}", equipment_id, site);
    Ok(Json(
        service
            .delete_note(&site, &equipment_id, &body.note_text)
            .await?,
    ))
}
