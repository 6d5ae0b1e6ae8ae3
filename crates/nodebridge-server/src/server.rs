//! HTTP surface: the WebSocket upgrade route and optional local API.
//!
//! The upgrade handler is the only place where the auth gate and the
//! gateway loop meet: the gate validates the request (suspending on the
//! token fetch), and only then is the 101 response sent and the socket
//! handed to the session loop.

use axum::extract::{State, WebSocketUpgrade};
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tracing::debug;

use nodebridge_core::TOKEN_MARKER;

use crate::gate::AuthGate;
use crate::gateway::GatewayHandle;
use crate::local_api::LocalApi;
use crate::session;

/// Shared state for the upgrade route.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AuthGate>,
    pub gateway: GatewayHandle,
}

/// Build the gateway router. The local token-store API is mounted only in
/// test/dev deployments.
pub fn router(state: AppState, local_api: Option<LocalApi>) -> Router {
    let mut router = Router::new()
        .route("/ws/{*path}", get(ws_upgrade))
        .with_state(state);
    if let Some(api) = local_api {
        router = router.merge(api.router());
    }
    router
}

async fn ws_upgrade(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    debug!(path = %uri.path(), "websocket connection request");
    let protocols = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok());

    match state.gate.authorize(uri.path(), protocols).await {
        Ok(ticket) => ws
            .protocols([TOKEN_MARKER])
            .on_upgrade(move |socket| session::run(socket, ticket, state.gateway.clone())),
        Err(rejection) => rejection.into_response(),
    }
}
