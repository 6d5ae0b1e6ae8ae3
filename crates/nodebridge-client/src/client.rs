//! WebSocket client: token handshake and terminal bridging.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use nodebridge_core::{BridgeError, BridgeResult, SubprotocolOffer};

/// The connected WebSocket stream type.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a gateway connection, offering `[<user>?, "token", <token>]` as
/// subprotocols. The gateway answers the upgrade only after the token has
/// been verified, so an authentication failure surfaces here as a failed
/// connect.
pub async fn connect(url: &str, user: Option<&str>, token: &str) -> BridgeResult<WsStream> {
    let offer = SubprotocolOffer {
        user: user.map(str::to_string),
        token: token.to_string(),
    };

    let mut request = url
        .into_client_request()
        .map_err(|e| BridgeError::Transport(format!("invalid websocket url: {e}")))?;
    let header = HeaderValue::from_str(&offer.offers().join(","))
        .map_err(|e| BridgeError::Transport(format!("invalid subprotocol value: {e}")))?;
    request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, header);

    let (stream, response) = connect_async(request)
        .await
        .map_err(|e| BridgeError::Transport(format!("websocket connection failed: {e}")))?;
    debug!(status = %response.status(), "websocket connection opened");
    Ok(stream)
}

/// Bridges a gateway connection to the local terminal.
pub struct WebsocketClient {
    url: String,
    token: String,
    user: Option<String>,
}

impl WebsocketClient {
    pub fn new(url: &str, token: &str) -> Self {
        Self {
            url: url.to_string(),
            token: token.to_string(),
            user: None,
        }
    }

    /// Offer a user identity as the leading subprotocol entry.
    pub fn with_user(mut self, user: Option<&str>) -> Self {
        self.user = user.map(str::to_string);
        self
    }

    /// Connect, then relay stdin lines to the gateway and gateway frames
    /// to stdout until either side closes.
    pub async fn run(&self) -> BridgeResult<()> {
        let stream = connect(&self.url, self.user.as_deref(), &self.token).await?;
        let (mut sink, mut messages) = stream.split();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        sink.send(Message::Text(format!("{line}\n")))
                            .await
                            .map_err(|e| BridgeError::Transport(format!("websocket send failed: {e}")))?;
                    }
                    Ok(None) => break,
                    Err(e) => return Err(BridgeError::Io(e)),
                },
                message = messages.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        stdout.write_all(text.as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        stdout.write_all(&data).await?;
                        stdout.flush().await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        match frame {
                            Some(frame) => {
                                info!(code = %frame.code, reason = %frame.reason, "connection closed")
                            }
                            None => info!("connection closed"),
                        }
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket receive failed");
                        break;
                    }
                    None => {
                        debug!("websocket connection closed");
                        break;
                    }
                },
            }
        }

        Ok(())
    }
}
