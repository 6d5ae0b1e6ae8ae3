//! nodebridge-core: shared library for the nodebridge gateway.
//!
//! Provides the protocol vocabulary shared by the server, the client library
//! and the CLI (WebSocket path grammar, subprotocol token grammar, connection
//! kinds, close codes), the error taxonomy, and the REST client for the
//! experiment-management API.

pub mod api;
pub mod error;
pub mod protocol;

// Re-export commonly used items at crate root.
pub use api::ApiClient;
pub use error::{BridgeError, BridgeResult};
pub use protocol::{
    close, BackendKind, ConnectionKind, RequestPath, SubprotocolOffer, SERIAL_PORT, SSH_PORT,
    TOKEN_MARKER,
};
