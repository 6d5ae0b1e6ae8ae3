//! Local token-store API for test/dev deployments.
//!
//! Serves the same two resources as the experiment-management API so a
//! standalone gateway can authenticate against itself: the configured
//! token and node list, for any experiment id.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::debug;

/// The local stand-in for the experiment-management API.
#[derive(Debug, Clone)]
pub struct LocalApi {
    token: String,
    nodes: Vec<String>,
}

impl LocalApi {
    pub fn new(token: String, nodes: Vec<String>) -> Self {
        Self { token, nodes }
    }

    /// Routes mirroring the external API surface.
    pub fn router(self) -> Router {
        let api = Arc::new(self);
        Router::new()
            .route("/api/experiments/{experiment_id}/token", get(token_handler))
            .route("/api/experiments/{experiment_id}/nodes", get(nodes_handler))
            .with_state(api)
    }
}

async fn token_handler(
    State(api): State<Arc<LocalApi>>,
    Path(experiment_id): Path<String>,
) -> Response {
    if api.token.is_empty() {
        debug!(experiment = %experiment_id, "token request failed: no internal token set");
        return (StatusCode::BAD_REQUEST, "No internal token set").into_response();
    }
    debug!(experiment = %experiment_id, "token request");
    Json(json!({ "token": api.token })).into_response()
}

async fn nodes_handler(
    State(api): State<Arc<LocalApi>>,
    Path(experiment_id): Path<String>,
) -> Response {
    debug!(experiment = %experiment_id, "nodes request");
    Json(json!({ "nodes": api.nodes })).into_response()
}
