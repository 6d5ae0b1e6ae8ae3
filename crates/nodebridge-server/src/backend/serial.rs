//! TCP backend for a node's serial console.
//!
//! Serial output is not line-delimited, so the read loop consumes the
//! stream one byte at a time and forwards each byte immediately instead of
//! buffering for a delimiter. The relay layer decides per session whether
//! the byte is delivered as text (lossy UTF-8) or binary.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Backend, BackendEvent};
use crate::registry::ChannelKey;

enum Command {
    Write(Vec<u8>),
    Shutdown,
}

/// Backend connection to a node's serial TCP port.
pub struct SerialBackend {
    key: ChannelKey,
    ready: bool,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<BackendEvent>,
}

impl SerialBackend {
    /// Spawn the transport task and return the handle tracked by the
    /// registry. The task reports progress through `events`.
    pub fn start(
        key: ChannelKey,
        port: u16,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(key.clone(), port, events.clone(), cmd_rx));
        Self {
            key,
            ready: false,
            cmd_tx,
            events,
        }
    }
}

impl Backend for SerialBackend {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    fn send(&mut self, payload: &[u8]) {
        if !self.ready {
            return;
        }
        let _ = self.cmd_tx.send(Command::Write(payload.to_vec()));
    }

    fn stop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if !self.ready {
            let _ = self.events.send(BackendEvent::Closed {
                key: self.key.clone(),
            });
        }
    }
}

async fn run(
    key: ChannelKey,
    port: u16,
    events: mpsc::UnboundedSender<BackendEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let node = key.node().to_string();
    debug!(node = %node, port, "opening TCP connection");

    let stream = match TcpStream::connect((node.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(node = %node, port, error = %e, "cannot open TCP connection");
            let _ = events.send(BackendEvent::Closed { key });
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    debug!(node = %node, port, "TCP connection opened");
    let _ = events.send(BackendEvent::Ready { key: key.clone() });

    let (mut reader, mut writer) = stream.into_split();
    let mut byte = [0u8; 1];
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Write(data)) => {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(Command::Shutdown) | None => break,
            },
            read = reader.read(&mut byte) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let _ = events.send(BackendEvent::Data {
                        key: key.clone(),
                        payload: byte.to_vec(),
                    });
                }
            },
        }
    }

    debug!(node = %node, "TCP connection closed");
    let _ = events.send(BackendEvent::Closed { key });
}
