//! REST client for the experiment-management API.
//!
//! The gateway consumes two resources, both JSON GETs:
//! `<base>/api/experiments/<id>/token` and
//! `<base>/api/experiments/<id>/nodes`. Non-2xx responses and malformed
//! bodies are reported as [`BridgeError::Api`] fetch failures.

use serde::Deserialize;
use tracing::debug;

use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct NodesResponse {
    nodes: Vec<String>,
}

/// Client for the experiment-management REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    protocol: String,
    host: String,
    port: u16,
    username: String,
    password: String,
}

impl ApiClient {
    pub fn new(protocol: &str, host: &str, port: u16) -> Self {
        Self {
            http: reqwest::Client::new(),
            protocol: protocol.to_string(),
            host: host.to_string(),
            port,
            username: String::new(),
            password: String::new(),
        }
    }

    /// Attach basic-auth credentials to every API request.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    /// Base URL for experiment resources.
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}/api/experiments",
            self.protocol, self.host, self.port
        )
    }

    async fn fetch(&self, experiment_id: &str, resource: &str) -> BridgeResult<reqwest::Response> {
        let url = format!("{}/{}/{}", self.url(), experiment_id, resource);
        debug!(url = %url, "fetching API resource");

        let mut request = self
            .http
            .get(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BridgeError::Api(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response)
    }

    /// Fetch the experiment's authentication token.
    pub async fn fetch_token(&self, experiment_id: &str) -> BridgeResult<String> {
        let response: TokenResponse = self.fetch(experiment_id, "token").await?.json().await?;
        Ok(response.token)
    }

    /// Fetch the list of nodes registered to the experiment.
    pub async fn fetch_nodes(&self, experiment_id: &str) -> BridgeResult<Vec<String>> {
        let response: NodesResponse = self.fetch(experiment_id, "nodes").await?.json().await?;
        Ok(response.nodes)
    }
}
