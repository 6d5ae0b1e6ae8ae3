//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use nodebridge_core::{BridgeError, BridgeResult, SERIAL_PORT, SSH_PORT};

use crate::backend::SshSettings;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub ssh: SshSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_serial_port")]
    pub serial_port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            serial_port: default_serial_port(),
        }
    }
}

/// `[api]` section: where tokens and node lists come from.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_api_protocol")]
    pub protocol: String,
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Nodes served by the local API in test/dev deployments.
    #[serde(default)]
    pub local_nodes: Vec<String>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            protocol: default_api_protocol(),
            host: default_api_host(),
            port: default_api_port(),
            username: String::new(),
            password: String::new(),
            local_nodes: Vec::new(),
        }
    }
}

/// `[policy]` section: admission caps.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicySection {
    #[serde(default = "default_max_node_sessions")]
    pub max_node_sessions: usize,
    #[serde(default = "default_max_user_sessions")]
    pub max_user_sessions: usize,
    #[serde(default)]
    pub check_nodes: bool,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            max_node_sessions: default_max_node_sessions(),
            max_user_sessions: default_max_user_sessions(),
            check_nodes: false,
        }
    }
}

/// `[ssh]` section: shell backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SshSection {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub key: Option<String>,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
            key: None,
        }
    }
}

fn default_port() -> u16 {
    8000
}
fn default_serial_port() -> u16 {
    SERIAL_PORT
}
fn default_api_protocol() -> String {
    "https".to_string()
}
fn default_api_host() -> String {
    "localhost".to_string()
}
fn default_api_port() -> u16 {
    8000
}
fn default_max_node_sessions() -> usize {
    2
}
fn default_max_user_sessions() -> usize {
    10
}
fn default_ssh_user() -> String {
    "root".to_string()
}
fn default_ssh_port() -> u16 {
    SSH_PORT
}

/// CLI overrides applied on top of the config file.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub api_protocol: Option<String>,
    pub api_host: Option<String>,
    pub api_port: Option<u16>,
    pub api_user: Option<String>,
    pub api_password: Option<String>,
    pub use_local_api: bool,
    pub token: Option<String>,
    pub check_nodes: bool,
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub serial_port: u16,
    pub api_protocol: String,
    pub api_host: String,
    pub api_port: u16,
    pub api_username: String,
    pub api_password: String,
    pub max_node_sessions: usize,
    pub max_user_sessions: usize,
    pub check_nodes: bool,
    pub use_local_api: bool,
    /// Token served by the local API.
    pub local_token: String,
    pub local_nodes: Vec<String>,
    pub ssh: SshSettings,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> BridgeResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| BridgeError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let use_local_api = cli.use_local_api;
        // A local-api deployment authenticates against itself over plain
        // HTTP on the gateway's own port.
        let port = cli.port.unwrap_or(file_config.server.port);
        let (api_protocol, api_host, api_port) = if use_local_api {
            ("http".to_string(), "localhost".to_string(), port)
        } else {
            (
                cli.api_protocol.unwrap_or(file_config.api.protocol),
                cli.api_host.unwrap_or(file_config.api.host),
                cli.api_port.unwrap_or(file_config.api.port),
            )
        };

        Ok(Self {
            port,
            serial_port: file_config.server.serial_port,
            api_protocol,
            api_host,
            api_port,
            api_username: cli.api_user.unwrap_or(file_config.api.username),
            api_password: cli.api_password.unwrap_or(file_config.api.password),
            max_node_sessions: file_config.policy.max_node_sessions,
            max_user_sessions: file_config.policy.max_user_sessions,
            check_nodes: cli.check_nodes || file_config.policy.check_nodes,
            use_local_api,
            local_token: cli.token.unwrap_or_default(),
            local_nodes: file_config.api.local_nodes,
            ssh: SshSettings {
                user: file_config.ssh.user,
                port: file_config.ssh.port,
                key_path: file_config.ssh.key.map(|key| expand_tilde_str(&key)),
            },
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let config = ServerConfig::load(None, CliOverrides::default()).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.serial_port, SERIAL_PORT);
        assert_eq!(config.api_protocol, "https");
        assert_eq!(config.max_node_sessions, 2);
        assert_eq!(config.max_user_sessions, 10);
        assert!(!config.check_nodes);
        assert_eq!(config.ssh.user, "root");
        assert_eq!(config.ssh.port, SSH_PORT);
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
port = 9000

[api]
protocol = "http"
host = "api.example.org"
port = 8080
username = "svc"

[policy]
max_node_sessions = 4
check_nodes = true

[ssh]
user = "admin"
port = 2222
"#
        )
        .unwrap();

        let cli = CliOverrides {
            port: Some(9001),
            api_host: Some("override.example.org".to_string()),
            ..CliOverrides::default()
        };
        let config = ServerConfig::load(Some(file.path()), cli).unwrap();

        assert_eq!(config.port, 9001);
        assert_eq!(config.api_protocol, "http");
        assert_eq!(config.api_host, "override.example.org");
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.api_username, "svc");
        assert_eq!(config.max_node_sessions, 4);
        assert_eq!(config.max_user_sessions, 10);
        assert!(config.check_nodes);
        assert_eq!(config.ssh.user, "admin");
        assert_eq!(config.ssh.port, 2222);
    }

    #[test]
    fn local_api_points_the_client_at_itself() {
        let cli = CliOverrides {
            port: Some(9000),
            use_local_api: true,
            token: Some("s3cr3t".to_string()),
            api_protocol: Some("https".to_string()),
            api_host: Some("api.example.org".to_string()),
            ..CliOverrides::default()
        };
        let config = ServerConfig::load(None, cli).unwrap();

        assert!(config.use_local_api);
        assert_eq!(config.api_protocol, "http");
        assert_eq!(config.api_host, "localhost");
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.local_token, "s3cr3t");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[server\nport = nine").unwrap();
        let result = ServerConfig::load(Some(file.path()), CliOverrides::default());
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }
}
