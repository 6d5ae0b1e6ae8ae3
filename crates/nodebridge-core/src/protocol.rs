//! Wire-level vocabulary shared by the gateway and its clients.
//!
//! Covers the WebSocket upgrade path grammar, the `Sec-WebSocket-Protocol`
//! token grammar, connection kinds, and the close codes the gateway emits.

use std::fmt;

use crate::error::BridgeError;

/// Fixed marker the client must offer as subprotocol; echoed back on success
/// so the client can confirm authentication.
pub const TOKEN_MARKER: &str = "token";

/// Well-known TCP port exposing a node's serial console.
pub const SERIAL_PORT: u16 = 20000;

/// SSH port for node shell access.
pub const SSH_PORT: u16 = 22;

/// The kind of bridged connection a client requests in the upgrade path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Serial console, frames relayed as text (lossy UTF-8 decode).
    Serial,
    /// Serial console, frames relayed as binary, bytes unmodified.
    SerialRaw,
    /// Interactive shell over SSH.
    Ssh,
}

impl ConnectionKind {
    /// The backend transport this kind maps to.
    pub fn backend(self) -> BackendKind {
        match self {
            ConnectionKind::Serial | ConnectionKind::SerialRaw => BackendKind::Serial,
            ConnectionKind::Ssh => BackendKind::Ssh,
        }
    }

    /// Whether backend data is relayed to the session as binary frames.
    /// SSH output is forwarded as-is; `serial/raw` was requested explicitly.
    pub fn is_binary(self) -> bool {
        matches!(self, ConnectionKind::SerialRaw | ConnectionKind::Ssh)
    }

    /// Path suffix selecting this kind in the upgrade URL.
    pub fn as_path(self) -> &'static str {
        match self {
            ConnectionKind::Serial => "serial",
            ConnectionKind::SerialRaw => "serial/raw",
            ConnectionKind::Ssh => "ssh",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_path())
    }
}

/// Backend transport kinds. At most one live backend connection per
/// registry key exists for each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Serial,
    Ssh,
}

impl BackendKind {
    /// Transport name used in messages surfaced to the session peer.
    pub fn transport_label(self) -> &'static str {
        match self {
            BackendKind::Serial => "TCP",
            BackendKind::Ssh => "SSH",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Serial => f.write_str("serial"),
            BackendKind::Ssh => f.write_str("ssh"),
        }
    }
}

/// Parsed WebSocket upgrade path:
/// `/ws/<site>/<experiment-id>/<node>/<kind>` with `<kind>` one of
/// `serial`, `serial/raw`, `ssh`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPath {
    pub site: String,
    pub experiment_id: String,
    pub node: String,
    pub kind: ConnectionKind,
}

impl RequestPath {
    /// Parse an upgrade request path. Any mismatch (segment count, empty
    /// segment, unknown kind) is a `404 Not Found` at the HTTP layer.
    pub fn parse(path: &str) -> Result<Self, BridgeError> {
        let invalid = || BridgeError::InvalidPath(format!("invalid url {path}"));

        let segments: Vec<&str> = path.split('/').collect();
        if !(6..=7).contains(&segments.len()) {
            return Err(invalid());
        }
        if !segments[0].is_empty() || segments[1] != "ws" {
            return Err(invalid());
        }
        if segments[2..5].iter().any(|s| s.is_empty()) {
            return Err(invalid());
        }

        let kind = match &segments[5..] {
            ["serial"] => ConnectionKind::Serial,
            ["serial", "raw"] => ConnectionKind::SerialRaw,
            ["ssh"] => ConnectionKind::Ssh,
            _ => return Err(invalid()),
        };

        Ok(RequestPath {
            site: segments[2].to_string(),
            experiment_id: segments[3].to_string(),
            node: segments[4].to_string(),
            kind,
        })
    }

    /// Rebuild the upgrade path, e.g. for the client CLI.
    pub fn to_path(&self) -> String {
        format!(
            "/ws/{}/{}/{}/{}",
            self.site,
            self.experiment_id,
            self.node,
            self.kind.as_path()
        )
    }
}

/// Parsed `Sec-WebSocket-Protocol` offer: `[<user>?, "token", <token>]`.
///
/// The marker and the bearer token occupy the final two positions; an
/// optional leading entry carries the user identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubprotocolOffer {
    pub user: Option<String>,
    pub token: String,
}

impl SubprotocolOffer {
    /// Parse the raw header value (comma-separated subprotocol list).
    pub fn parse(header: &str) -> Result<Self, BridgeError> {
        let invalid = |msg: &str| BridgeError::InvalidSubprotocol(msg.to_string());

        let entries: Vec<&str> = header.split(',').map(str::trim).collect();
        let (user, marker, token) = match entries.as_slice() {
            [marker, token] => (None, *marker, *token),
            [user, marker, token] => (Some(user.to_string()), *marker, *token),
            _ => return Err(invalid("expected two or three subprotocols")),
        };

        if marker != TOKEN_MARKER {
            return Err(invalid("missing token marker"));
        }
        if token.is_empty() || user.as_deref() == Some("") {
            return Err(invalid("empty subprotocol entry"));
        }

        Ok(SubprotocolOffer {
            user,
            token: token.to_string(),
        })
    }

    /// The subprotocol list a client offers during the handshake.
    pub fn offers(&self) -> Vec<String> {
        let mut offers = Vec::with_capacity(3);
        if let Some(user) = &self.user {
            offers.push(user.clone());
        }
        offers.push(TOKEN_MARKER.to_string());
        offers.push(self.token.clone());
        offers
    }
}

/// Close codes emitted to WebSocket clients.
pub mod close {
    /// Policy rejection (caps exceeded) or clean backend disconnect.
    pub const NORMAL: u16 = 1000;
    /// Server shutdown or backend unreachable.
    pub const GOING_AWAY: u16 = 1001;
}
