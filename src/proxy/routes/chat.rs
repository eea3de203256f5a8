//! OpenAI-compatible chat completions endpoint.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;

use crate::proxy::state::AppState;
use crate::translate::WireFormat;

pub async fn completions(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    super::dispatch_and_render(&state.dispatcher, WireFormat::OpenAi, headers, None, None, body).await
}
