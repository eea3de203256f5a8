//! Router assembly and the serve loop.
//!
//! Grounded on the teacher's `proxy::start_proxy` — bind, build the router,
//! `axum::serve(...).with_graceful_shutdown(...)` — generalized from the
//! teacher's single catch-all route to the gateway's fixed surface of
//! OpenAI-compatible, native, cache, admin, and health routes.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::routing::{delete, get, patch, post};
use axum::Router;
use tokio::net::TcpListener;

use super::routes;
use super::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(routes::chat::completions))
        .route("/v1/models", get(routes::models::list_models))
        .route(
            "/v2/models/:model_action",
            post(routes::native::generate_content),
        )
        .route("/api/v1/caches", get(routes::caches::list_caches))
        .route("/api/v1/caches/:id", delete(routes::caches::delete_cache))
        .route("/api/v1/admin/keys", get(routes::admin::list_keys))
        .route("/api/v1/admin/keys", post(routes::admin::add_key))
        .route("/api/v1/admin/keys/:id", delete(routes::admin::remove_key))
        .route(
            "/api/v1/admin/keys/:id",
            patch(routes::admin::set_key_enabled),
        )
        .route("/healthz", get(routes::health::health))
        .with_state(state)
}

/// Bind and serve until `shutdown` fires, then return once in-flight
/// requests drain.
pub async fn start_proxy(
    bind_addr: SocketAddr,
    state: AppState,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<()> {
    let app = build_router(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind gateway listener")?;

    tracing::info!(addr = %bind_addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("gateway server error")?;

    tracing::info!("gateway shut down gracefully");
    Ok(())
}
