//! Native `generateContent`-shaped endpoint.
//!
//! The upstream wire convention packs an action onto the model segment
//! (`models/gemini-1.5-flash:generateContent`) rather than using a query
//! parameter or a distinct path component, so the whole segment is captured
//! and split here instead of relying on axum's path-param splitting.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;

use crate::proxy::state::AppState;
use crate::translate::WireFormat;

pub async fn generate_content(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (model, action) = model_action
        .split_once(':')
        .unwrap_or((model_action.as_str(), "generateContent"));
    let stream = action == "streamGenerateContent";
    super::dispatch_and_render(
        &state.dispatcher,
        WireFormat::Native,
        headers,
        Some(model.to_string()),
        Some(stream),
        body,
    )
    .await
}
