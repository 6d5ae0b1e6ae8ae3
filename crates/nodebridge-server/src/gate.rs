//! Authentication gate for WebSocket upgrade requests.
//!
//! Decides, before any data is exchanged, whether an upgrade may proceed:
//! path grammar, subprotocol grammar, token verification against the
//! experiment-management API, and the optional node-membership check.
//! Rejections surface as plain HTTP errors during the upgrade; the gate
//! never touches the connection registry.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use nodebridge_core::{ApiClient, RequestPath, SubprotocolOffer};

/// Outcome of a rejected upgrade.
#[derive(Debug, PartialEq, Eq)]
pub enum GateRejection {
    /// Malformed path: wrong segment count, empty segment, unknown kind.
    NotFound(String),
    /// Bad subprotocols, bad or unfetchable token, node not in experiment.
    Unauthorized(String),
}

impl GateRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            GateRejection::NotFound(_) => StatusCode::NOT_FOUND,
            GateRejection::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for GateRejection {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            GateRejection::NotFound(message) | GateRejection::Unauthorized(message) => message,
        };
        (status, message).into_response()
    }
}

/// An upgrade request the gate has validated.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub path: RequestPath,
    /// User identity from the optional leading subprotocol entry.
    pub user: Option<String>,
}

/// Validates upgrade requests against the experiment-management API.
pub struct AuthGate {
    api: ApiClient,
    check_nodes: bool,
}

impl AuthGate {
    pub fn new(api: ApiClient, check_nodes: bool) -> Self {
        Self { api, check_nodes }
    }

    /// Validate one upgrade request. `protocols` is the raw
    /// `Sec-WebSocket-Protocol` header value, when present.
    pub async fn authorize(
        &self,
        path: &str,
        protocols: Option<&str>,
    ) -> Result<Ticket, GateRejection> {
        let request = RequestPath::parse(path).map_err(|e| {
            warn!(path = %path, "rejecting websocket connection: invalid url");
            GateRejection::NotFound(e.to_string())
        })?;

        let offer = SubprotocolOffer::parse(protocols.unwrap_or_default()).map_err(|_| {
            warn!(path = %path, "rejecting websocket connection: invalid subprotocols");
            GateRejection::Unauthorized("Invalid subprotocols".to_string())
        })?;

        let api_token = self
            .api
            .fetch_token(&request.experiment_id)
            .await
            .map_err(|e| {
                warn!(experiment = %request.experiment_id, error = %e, "failed to fetch token");
                GateRejection::Unauthorized("Failed to fetch token".to_string())
            })?;
        debug!(experiment = %request.experiment_id, "fetched token for experiment");

        if offer.token != api_token {
            warn!(experiment = %request.experiment_id, "rejecting websocket connection: invalid token");
            return Err(GateRejection::Unauthorized(format!(
                "Invalid token '{}'",
                offer.token
            )));
        }

        if self.check_nodes {
            self.check_node(&request).await?;
        }

        debug!(node = %request.node, experiment = %request.experiment_id, "upgrade authorized");
        Ok(Ticket {
            path: request,
            user: offer.user,
        })
    }

    /// Verify the requested node belongs to the experiment. Node entries
    /// come back as `<host>.<site>.<domain...>` network addresses.
    async fn check_node(&self, request: &RequestPath) -> Result<(), GateRejection> {
        let nodes = self
            .api
            .fetch_nodes(&request.experiment_id)
            .await
            .map_err(|e| {
                warn!(experiment = %request.experiment_id, error = %e, "failed to fetch nodes");
                GateRejection::Unauthorized("Failed to fetch nodes".to_string())
            })?;

        let matches_request = |entry: &str| {
            let mut parts = entry.split('.');
            parts.next() == Some(request.node.as_str())
                && parts.next() == Some(request.site.as_str())
        };
        if nodes.iter().any(|entry| matches_request(entry)) {
            return Ok(());
        }

        warn!(
            node = %request.node,
            site = %request.site,
            experiment = %request.experiment_id,
            "rejecting websocket connection: node not in experiment"
        );
        Err(GateRejection::Unauthorized("Invalid node".to_string()))
    }
}
