//! Per-connection WebSocket session loop.
//!
//! Runs after the auth gate admitted the upgrade: registers the session
//! with the gateway, then pumps frames both directions until either side
//! closes. All registry bookkeeping happens in the gateway loop; this task
//! only owns the socket.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::gate::Ticket;
use crate::gateway::{Admission, GatewayHandle, SessionInfo, SessionOutput};

/// Drive one authenticated WebSocket session to completion.
pub async fn run(mut socket: WebSocket, ticket: Ticket, gateway: GatewayHandle) {
    let id = gateway.next_session_id();
    let info = SessionInfo {
        id,
        site: ticket.path.site.clone(),
        experiment_id: ticket.path.experiment_id.clone(),
        node: ticket.path.node.clone(),
        user: ticket.user.clone().unwrap_or_else(|| "anonymous".to_string()),
        kind: ticket.path.kind,
    };
    let node = info.node.clone();
    let kind = info.kind;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    match gateway.open_session(info, out_tx).await {
        Admission::Admitted => {}
        Admission::Rejected { code, reason } => {
            info!(node = %node, code, reason = %reason, "rejecting websocket connection");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    }
    info!(node = %node, session = id, kind = %kind, "websocket connection opened");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            output = out_rx.recv() => match output {
                Some(SessionOutput::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(SessionOutput::Binary(data)) => {
                    if sink.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                }
                Some(SessionOutput::Close { code, reason }) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    gateway.session_data(id, text.as_bytes().to_vec());
                }
                Some(Ok(Message::Binary(data))) => {
                    gateway.session_data(id, data.to_vec());
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(node = %node, session = id, ?frame, "close frame received");
                    break;
                }
                // Ping/pong are answered by the axum layer.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(node = %node, session = id, error = %e, "websocket receive failed");
                    break;
                }
                None => break,
            },
        }
    }

    gateway.session_closed(id);
    info!(node = %node, session = id, "websocket connection closed");
}
