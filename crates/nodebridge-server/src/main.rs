//! nodebridge-server: testbed WebSocket gateway.
//!
//! Bridges browser WebSocket clients to testbed node consoles (TCP serial)
//! and shells (SSH), with per-connection token authentication delegated to
//! the experiment-management API.

mod backend;
mod config;
mod gate;
mod gateway;
mod local_api;
mod registry;
mod server;
mod session;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use nodebridge_core::ApiClient;

use backend::NodeBackendFactory;
use config::{CliOverrides, ServerConfig};
use gate::AuthGate;
use gateway::{AdmissionPolicy, Gateway, GatewayHandle};
use local_api::LocalApi;
use server::AppState;

/// nodebridge-server — testbed WebSocket gateway
#[derive(Parser, Debug)]
#[command(name = "nodebridge-server", version, about = "Testbed WebSocket gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Protocol used to reach the experiment-management API
    #[arg(long, value_parser = ["https", "http"])]
    api_protocol: Option<String>,

    /// Experiment-management API host
    #[arg(long)]
    api_host: Option<String>,

    /// Experiment-management API port
    #[arg(long)]
    api_port: Option<u16>,

    /// Username used to connect to the API
    #[arg(long)]
    api_user: Option<String>,

    /// Password used to connect to the API
    #[arg(long)]
    api_password: Option<String>,

    /// Serve a local token store and authenticate against it (test/dev)
    #[arg(long)]
    use_local_api: bool,

    /// Token served by the local API
    #[arg(long)]
    token: Option<String>,

    /// Verify that requested nodes belong to the experiment
    #[arg(long)]
    check_nodes: bool,

    /// Config file path
    #[arg(long, default_value = "~/.nodebridge/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        port: cli.port,
        api_protocol: cli.api_protocol,
        api_host: cli.api_host,
        api_port: cli.api_port,
        api_user: cli.api_user,
        api_password: cli.api_password,
        use_local_api: cli.use_local_api,
        token: cli.token,
        check_nodes: cli.check_nodes,
    };
    let config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        "starting nodebridge-server"
    );

    let api = ApiClient::new(&config.api_protocol, &config.api_host, config.api_port)
        .with_credentials(&config.api_username, &config.api_password);
    let gate = Arc::new(AuthGate::new(api, config.check_nodes));

    let policy = AdmissionPolicy {
        max_node_sessions: config.max_node_sessions,
        max_user_sessions: config.max_user_sessions,
    };
    let factory = NodeBackendFactory {
        serial_port: config.serial_port,
        ssh: config.ssh.clone(),
    };
    let gateway = Gateway::spawn(policy, Box::new(factory));

    let local_api = config
        .use_local_api
        .then(|| LocalApi::new(config.local_token.clone(), config.local_nodes.clone()));
    let app = server::router(
        AppState {
            gate,
            gateway: gateway.clone(),
        },
        local_api,
    );

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port = config.port, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(port = config.port, "listening for websocket connections");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(gateway))
        .await
    {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("nodebridge-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then close every tracked session.
async fn shutdown_signal(gateway: GatewayHandle) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
    gateway.shutdown();
}
