//! HTTP server setup.

use std::sync::Arc;

use anyhow::Context as _;
use axum::{Json, Router, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use super::v0;
use crate::context::FleetContext;
use crate::scheduler::Scheduler;
use crate::tracing::prelude::*;

/// State shared by every handler.
#[derive(Clone)]
pub struct SharedState {
    pub ctx: Arc<FleetContext>,
    pub scheduler: Arc<Scheduler>,
}

#[derive(OpenApi)]
#[openapi(info(title = "minefleet", description = "Mining fleet control API"))]
struct ApiDoc;

/// Build the application router: the v0 API under `/api/v0` and its
/// OpenAPI document at `/api/v0/openapi.json`.
pub fn build_router(state: SharedState) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .nest("/api/v0", v0::routes())
        .split_for_parts();

    router
        .route("/api/v0/openapi.json", get(move || async move { Json(api) }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` is cancelled.
pub async fn serve(
    addr: String,
    state: SharedState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding API to {addr}"))?;
    info!(addr = %listener.local_addr()?, "API server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    debug!("API server stopped");
    Ok(())
}
