//! Backend connections to testbed nodes.
//!
//! A backend owns one transport connection to one node (plain TCP for the
//! serial console, SSH for an interactive shell) and translates the raw
//! byte stream into [`BackendEvent`]s consumed by the gateway event loop.
//!
//! Both variants follow the same state machine:
//!
//! ```text
//! idle → connecting → ready → closed
//! ```
//!
//! A connect failure transitions straight to `closed` (a `Closed` event
//! without a preceding `Ready`), which is the gateway's signal to reject
//! pending subscribers. The transport task emits `Closed` exactly once from
//! its own loop; `stop()` on a never-ready backend emits it directly to
//! cover the subscriber-arrived-while-connect-was-failing race.

pub mod serial;
pub mod ssh;

use tokio::sync::mpsc;

use crate::registry::ChannelKey;

pub use serial::SerialBackend;
pub use ssh::{SshBackend, SshSettings};

/// Events a backend transport task emits toward the gateway.
#[derive(Debug)]
pub enum BackendEvent {
    /// The transport connected; writes are now accepted.
    Ready { key: ChannelKey },
    /// Bytes arrived from the node.
    Data { key: ChannelKey, payload: Vec<u8> },
    /// The transport is gone: connect failure, remote close, or `stop()`.
    Closed { key: ChannelKey },
}

/// One transport connection to one node.
pub trait Backend: Send {
    fn is_ready(&self) -> bool;

    /// Flip the readiness flag; driven by the gateway when the transport
    /// task reports `Ready` or `Closed`.
    fn set_ready(&mut self, ready: bool);

    /// Write to the node transport. No-op unless ready.
    fn send(&mut self, payload: &[u8]);

    /// Close the transport. If the connection never became ready, emits
    /// `Closed` directly instead of waiting for the transport task.
    fn stop(&mut self);
}

/// Creates backend connections on first subscribe. The gateway holds this
/// as a trait object so tests can substitute scripted backends.
pub trait BackendFactory: Send {
    fn create(
        &self,
        key: &ChannelKey,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Box<dyn Backend>;
}

/// Production factory: TCP serial consoles and SSH shells.
pub struct NodeBackendFactory {
    pub serial_port: u16,
    pub ssh: SshSettings,
}

impl BackendFactory for NodeBackendFactory {
    fn create(
        &self,
        key: &ChannelKey,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Box<dyn Backend> {
        match key {
            ChannelKey::Serial { .. } => {
                Box::new(SerialBackend::start(key.clone(), self.serial_port, events))
            }
            ChannelKey::Ssh { .. } => {
                Box::new(SshBackend::start(key.clone(), self.ssh.clone(), events))
            }
        }
    }
}
