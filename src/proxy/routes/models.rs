//! Model listing.
//!
//! Synthesized from the model limits registry rather than proxied from
//! upstream — the registry is the gateway's own source of truth for which
//! models it's willing to route, independent of whatever the upstream
//! provider's catalog happens to list.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::proxy::state::AppState;

#[derive(Serialize)]
pub struct ModelListResponse {
    object: &'static str,
    data: Vec<ModelEntry>,
}

#[derive(Serialize)]
pub struct ModelEntry {
    id: String,
    object: &'static str,
    owned_by: &'static str,
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelListResponse> {
    let mut data: Vec<ModelEntry> = state
        .dispatcher
        .model_limits
        .model_ids()
        .map(|id| ModelEntry {
            id: id.to_string(),
            object: "model",
            owned_by: "gatekeeper",
        })
        .collect();
    data.sort_by(|a, b| a.id.cmp(&b.id));

    Json(ModelListResponse {
        object: "list",
        data,
    })
}
