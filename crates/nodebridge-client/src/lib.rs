//! nodebridge-client: plain WebSocket client for the nodebridge gateway.
//!
//! Connects with the gateway's subprotocol token handshake and bridges the
//! connection to the local terminal: stdin lines go to the node, node
//! output goes to stdout. Used for manual testing against a gateway.

pub mod client;

// Re-export primary public types.
pub use client::{connect, WebsocketClient, WsStream};

// Re-export core error types for convenience.
pub use nodebridge_core::{BridgeError, BridgeResult};
