//! SSH backend for a node's interactive shell.
//!
//! Opens an SSH session with a PTY and an interactive shell. The `ssh2`
//! channel has no async read primitive, so once ready the transport task
//! polls on a fixed interval, draining whatever bytes are currently
//! available without blocking.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use ssh2::{Channel, Session};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use nodebridge_core::{BridgeError, BridgeResult, SSH_PORT};

use super::{Backend, BackendEvent};
use crate::registry::ChannelKey;

/// Drain interval for the non-blocking channel reads.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The remote shell tears the session down on `exit`; the close event is
/// emitted proactively instead of waiting for the transport to notice.
const EXIT_COMMAND: &[u8] = b"exit\n";

/// SSH connection settings, shared by every shell backend.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub user: String,
    pub port: u16,
    /// Private key for authentication; agent auth when unset.
    pub key_path: Option<PathBuf>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: SSH_PORT,
            key_path: None,
        }
    }
}

enum Command {
    Write(Vec<u8>),
    Shutdown,
}

/// Backend connection to a node's shell over SSH.
pub struct SshBackend {
    key: ChannelKey,
    ready: bool,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<BackendEvent>,
}

impl SshBackend {
    pub fn start(
        key: ChannelKey,
        settings: SshSettings,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(key.clone(), settings, events.clone(), cmd_rx));
        Self {
            key,
            ready: false,
            cmd_tx,
            events,
        }
    }
}

impl Backend for SshBackend {
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

/// Connect, authenticate and invoke a shell on a PTY. Runs blocking `ssh2`
/// calls, so it is executed on the blocking pool. The session is switched
/// to non-blocking mode before it is handed to the polling loop.
fn open_shell(node: &str, settings: &SshSettings) -> BridgeResult<(Session, Channel)> {
    let ssh_err = |e: ssh2::Error| BridgeError::Backend(e.to_string());

    let tcp = std::net::TcpStream::connect((node, settings.port))?;
    let mut session = Session::new().map_err(ssh_err)?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(ssh_err)?;

    match &settings.key_path {
        Some(path) => session
            .userauth_pubkey_file(&settings.user, None, path, None)
            .map_err(ssh_err)?,
        None => session.userauth_agent(&settings.user).map_err(ssh_err)?,
    }
    if !session.authenticated() {
        return Err(BridgeError::AuthFailed(format!(
            "SSH authentication failed for {}@{}",
            settings.user, node
        )));
    }

    let mut channel = session.channel_session().map_err(ssh_err)?;
    channel.request_pty("xterm", None, None).map_err(ssh_err)?;
    channel.shell().map_err(ssh_err)?;
    session.set_blocking(false);
    Ok((session, channel))
}

async fn run(
    key: ChannelKey,
    settings: SshSettings,
    events: mpsc::UnboundedSender<BackendEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let node = key.node().to_string();
    debug!(node = %node, user = %settings.user, "opening SSH connection");

    let opened = {
        let node = node.clone();
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || open_shell(&node, &settings)).await
    };
    let (session, mut channel) = match opened {
        Ok(Ok(opened)) => opened,
        Ok(Err(e)) => {
            warn!(node = %node, error = %e, "cannot open SSH connection");
            let _ = events.send(BackendEvent::Closed { key });
            return;
        }
        Err(e) => {
            warn!(node = %node, error = %e, "SSH connect task failed");
            let _ = events.send(BackendEvent::Closed { key });
            return;
        }
    };
    debug!(node = %node, "SSH connection opened");
    let _ = events.send(BackendEvent::Ready { key: key.clone() });

    let mut poll = tokio::time::interval(POLL_INTERVAL);
    let mut buf = [0u8; 4096];
    'transport: loop {
        tokio::select! {
            _ = poll.tick() => {
                loop {
                    match channel.read(&mut buf) {
                        Ok(0) => break 'transport,
                        Ok(n) => {
                            let _ = events.send(BackendEvent::Data {
                                key: key.clone(),
                                payload: buf[..n].to_vec(),
                            });
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            debug!(node = %node, error = %e, "SSH read failed");
                            break 'transport;
                        }
                    }
                }
                if channel.eof() {
                    break 'transport;
                }
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Write(data)) => {
                    let closing = data == EXIT_COMMAND;
                    session.set_blocking(true);
                    let written = channel.write_all(&data).and_then(|_| channel.flush());
                    session.set_blocking(false);
                    if let Err(e) = written {
                        debug!(node = %node, error = %e, "SSH write failed");
                        break 'transport;
                    }
                    if closing {
                        debug!(node = %node, "exit command sent, closing SSH connection");
                        break 'transport;
                    }
                }
                Some(Command::Shutdown) | None => break 'transport,
            }
        }
    }

    session.set_blocking(true);
    let _ = channel.close();
    let _ = channel.wait_close();
    debug!(node = %node, "SSH connection closed");
    let _ = events.send(BackendEvent::Closed { key });
}
