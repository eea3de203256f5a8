//! Cache handle listing and deletion, scoped to the caller's own credential.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dispatch::error::{GatewayError, RenderedError};
use crate::proxy::state::AppState;
use crate::translate::WireFormat;

#[derive(Serialize)]
pub struct CacheHandleView {
    pub local_id: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub async fn list_caches(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let credential = match super::extract_credential(&headers) {
        Ok(c) => c,
        Err(e) => return RenderedError { error: e, format: WireFormat::Native }.into_response(),
    };

    match state
        .dispatcher
        .cache_index
        .list_for_credential(&credential, Utc::now())
        .await
    {
        Ok(handles) => Json(
            handles
                .into_iter()
                .map(|h| CacheHandleView {
                    local_id: h.local_id,
                    content_hash: h.content_hash,
                    created_at: h.created_at,
                    expires_at: h.expires_at,
                })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => RenderedError {
            error: GatewayError::ClientInput(e.to_string()),
            format: WireFormat::Native,
        }
        .into_response(),
    }
}

pub async fn delete_cache(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(local_id): Path<String>,
) -> Response {
    if super::extract_credential(&headers).is_err() {
        return RenderedError {
            error: GatewayError::Auth,
            format: WireFormat::Native,
        }
        .into_response();
    }

    match state.dispatcher.cache_index.delete(&local_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => RenderedError {
            error: GatewayError::ClientInput(e.to_string()),
            format: WireFormat::Native,
        }
        .into_response(),
    }
}
