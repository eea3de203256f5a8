//! Key-pool management, gated on a separate admin credential.
//!
//! Distinct from the `Authorization: Bearer` caller credential used by the
//! proxy routes — this surface manages the pool those callers draw from, so
//! it is checked against `AppState.admin_credential` instead of the context
//! store's credential namespace.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::error::{GatewayError, RenderedError};
use crate::key_pool::UpstreamKey;
use crate::proxy::state::AppState;
use crate::translate::WireFormat;

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), GatewayError> {
    let expected = state.admin_credential.as_deref().ok_or(GatewayError::Auth)?;
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|raw| raw.strip_prefix("Bearer ").unwrap_or(raw).trim())
        .ok_or(GatewayError::Auth)?;
    if presented == expected {
        Ok(())
    } else {
        Err(GatewayError::Auth)
    }
}

#[derive(Serialize)]
pub struct KeyView {
    pub id: String,
    pub description: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub context_completion_enabled: bool,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<UpstreamKey> for KeyView {
    fn from(k: UpstreamKey) -> Self {
        Self {
            id: k.id,
            description: k.description,
            enabled: k.enabled,
            created_at: k.created_at,
            expires_at: k.expires_at,
            context_completion_enabled: k.context_completion_enabled,
            last_used_at: k.last_used_at,
        }
    }
}

#[derive(Deserialize)]
pub struct AddKeyRequest {
    pub id: String,
    pub secret: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context_completion_enabled: bool,
}

fn default_true() -> bool {
    true
}

pub async fn list_keys(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = authorize(&state, &headers) {
        return RenderedError { error: e, format: WireFormat::Native }.into_response();
    }
    Json(
        state
            .dispatcher
            .key_pool
            .list_keys()
            .into_iter()
            .map(KeyView::from)
            .collect::<Vec<_>>(),
    )
    .into_response()
}

pub async fn add_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AddKeyRequest>,
) -> Response {
    if let Err(e) = authorize(&state, &headers) {
        return RenderedError { error: e, format: WireFormat::Native }.into_response();
    }

    let key = UpstreamKey {
        id: req.id,
        secret: req.secret,
        description: req.description,
        enabled: req.enabled,
        created_at: Utc::now(),
        expires_at: req.expires_at,
        context_completion_enabled: req.context_completion_enabled,
        last_used_at: None,
    };

    match state.dispatcher.key_pool.add_key(key) {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => RenderedError {
            error: GatewayError::ClientInput(e.to_string()),
            format: WireFormat::Native,
        }
        .into_response(),
    }
}

pub async fn remove_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = authorize(&state, &headers) {
        return RenderedError { error: e, format: WireFormat::Native }.into_response();
    }
    match state.dispatcher.key_pool.remove_key(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => RenderedError {
            error: GatewayError::ClientInput(e.to_string()),
            format: WireFormat::Native,
        }
        .into_response(),
    }
}

#[derive(Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

pub async fn set_key_enabled(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<SetEnabledRequest>,
) -> Response {
    if let Err(e) = authorize(&state, &headers) {
        return RenderedError { error: e, format: WireFormat::Native }.into_response();
    }
    match state.dispatcher.key_pool.set_enabled(&id, req.enabled) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => RenderedError {
            error: GatewayError::ClientInput(e.to_string()),
            format: WireFormat::Native,
        }
        .into_response(),
    }
}
