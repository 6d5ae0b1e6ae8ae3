//! nodebridge: command-line client for the nodebridge gateway.
//!
//! Fetches the experiment token from the API when not given on the command
//! line, then bridges stdin/stdout to the requested node connection.

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use tracing::debug;

use nodebridge_client::WebsocketClient;
use nodebridge_core::{ApiClient, ConnectionKind, RequestPath};

/// nodebridge — connect a terminal to a testbed node
#[derive(Parser, Debug)]
#[command(name = "nodebridge", version, about = "Websocket client for testbed nodes")]
struct Cli {
    /// Gateway host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Gateway port
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Node to connect to, as <hostname>.<site>
    #[arg(long)]
    node: String,

    /// Experiment id associated to the node
    #[arg(long)]
    exp_id: String,

    /// The type of connection
    #[arg(long, value_enum, default_value_t = Kind::Serial)]
    kind: Kind,

    /// Token used for authentication (fetched from the API when omitted)
    #[arg(long)]
    token: Option<String>,

    /// Protocol used to reach the experiment-management API
    #[arg(long, value_parser = ["https", "http"], default_value = "https")]
    api_protocol: String,

    /// Experiment-management API host
    #[arg(long, default_value = "localhost")]
    api_host: String,

    /// Experiment-management API port
    #[arg(long, default_value_t = 8000)]
    api_port: u16,

    /// Username used to connect to the API
    #[arg(long, default_value = "")]
    api_user: String,

    /// Password used to connect to the API
    #[arg(long, default_value = "")]
    api_password: String,

    /// Connect using the insecure ws:// protocol
    #[arg(long)]
    insecure: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "error")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Serial,
    SerialRaw,
    Ssh,
}

impl From<Kind> for ConnectionKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Serial => ConnectionKind::Serial,
            Kind::SerialRaw => ConnectionKind::SerialRaw,
            Kind::Ssh => ConnectionKind::Ssh,
        }
    }
}

/// Split a `<hostname>.<site>` node name.
fn split_node(node: &str) -> anyhow::Result<(String, String)> {
    let mut parts = node.splitn(3, '.');
    match (parts.next(), parts.next()) {
        (Some(host), Some(site)) if !host.is_empty() && !site.is_empty() => {
            Ok((host.to_string(), site.to_string()))
        }
        _ => bail!("invalid node name '{node}': expected <hostname>.<site>"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let (node, site) = split_node(&cli.node)?;

    let token = match &cli.token {
        Some(token) => token.clone(),
        None => {
            let api = ApiClient::new(&cli.api_protocol, &cli.api_host, cli.api_port)
                .with_credentials(&cli.api_user, &cli.api_password);
            api.fetch_token(&cli.exp_id)
                .await
                .context("cannot fetch token from API")?
        }
    };

    let path = RequestPath {
        site,
        experiment_id: cli.exp_id.clone(),
        node,
        kind: cli.kind.into(),
    }
    .to_path();
    let scheme = if cli.insecure { "ws" } else { "wss" };
    let url = format!("{scheme}://{}:{}{path}", cli.host, cli.port);
    debug!(url = %url, "connecting to gateway");

    let user = (!cli.api_user.is_empty()).then_some(cli.api_user.as_str());
    WebsocketClient::new(&url, &token)
        .with_user(user)
        .run()
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_node_hostname_and_site() {
        assert_eq!(
            split_node("m3-1.saclay").unwrap(),
            ("m3-1".to_string(), "saclay".to_string())
        );
        // Trailing domain parts are ignored.
        assert_eq!(
            split_node("m3-1.saclay.example.org").unwrap(),
            ("m3-1".to_string(), "saclay".to_string())
        );
    }

    #[test]
    fn split_node_rejects_bare_hostname() {
        assert!(split_node("m3-1").is_err());
        assert!(split_node("").is_err());
        assert!(split_node("m3-1.").is_err());
    }

    #[test]
    fn url_uses_request_path_grammar() {
        let path = RequestPath {
            site: "saclay".to_string(),
            experiment_id: "123".to_string(),
            node: "m3-1".to_string(),
            kind: Kind::SerialRaw.into(),
        }
        .to_path();
        assert_eq!(path, "/ws/saclay/123/m3-1/serial/raw");
    }
}
