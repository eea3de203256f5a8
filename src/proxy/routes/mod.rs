//! Route handlers, one module per surface.

pub mod admin;
pub mod caches;
pub mod chat;
pub mod health;
pub mod models;
pub mod native;

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::dispatch::error::{GatewayError, RenderedError};
use crate::dispatch::{DispatchOutcome, DispatchRequest, Dispatcher};
use crate::translate::WireFormat;
use crate::types::Credential;

/// Cancels its token when dropped. Attached to a streaming response body so
/// that when the HTTP layer drops the body — the client disconnected, or the
/// server is shutting the connection down — the detached stream-forwarder
/// task observes the cancellation rather than running until the upstream
/// connection itself closes.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Wraps a response body stream with a [`CancelOnDrop`] guard. Delegates
/// polling straight to the inner stream; the guard only matters at drop time.
struct CancellableStream<S> {
    inner: S,
    _cancel_on_drop: CancelOnDrop,
}

impl<S> CancellableStream<S> {
    fn new(inner: S, cancellation: CancellationToken) -> Self {
        Self {
            inner,
            _cancel_on_drop: CancelOnDrop(cancellation),
        }
    }
}

impl<S: Stream + Unpin> Stream for CancellableStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Pull the caller's credential out of `Authorization: Bearer <credential>`.
fn extract_credential(headers: &HeaderMap) -> Result<Credential, GatewayError> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::Auth)?;
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
    if token.is_empty() {
        return Err(GatewayError::Auth);
    }
    Ok(Credential::new(token))
}

/// Shared tail end of both wire-format routes: build the dispatch request,
/// run it, and render either a buffered JSON response or an SSE stream.
async fn dispatch_and_render(
    dispatcher: &Dispatcher,
    format: WireFormat,
    headers: HeaderMap,
    path_model_hint: Option<String>,
    stream_override: Option<bool>,
    body: Bytes,
) -> Response {
    let credential = match extract_credential(&headers) {
        Ok(c) => c,
        Err(e) => return RenderedError { error: e, format }.into_response(),
    };
    let requested_cache_handle = headers
        .get("x-gatekeeper-cache-handle")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let cancellation = CancellationToken::new();

    let req = DispatchRequest {
        credential,
        format,
        path_model_hint,
        body: body.to_vec(),
        requested_cache_handle,
        cancellation: cancellation.clone(),
        stream_override,
    };

    match dispatcher.dispatch(req).await {
        Ok(DispatchOutcome::Buffered(bytes)) => Response::builder()
            .status(axum::http::StatusCode::OK)
            .header("content-type", "application/json")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| Response::new(Body::from("internal error"))),
        Ok(DispatchOutcome::Stream(reply)) => Response::builder()
            .status(axum::http::StatusCode::OK)
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache")
            .body(Body::from_stream(CancellableStream::new(reply.frames, cancellation)))
            .unwrap_or_else(|_| Response::new(Body::from("internal error"))),
        Err(e) => RenderedError { error: e, format }.into_response(),
    }
}
