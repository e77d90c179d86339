//! WebSocket carrier: JSON text frames over tokio-tungstenite, one message
//! per frame. The client side exposes a [`ClientTransport`]; the server side
//! runs one [`ServerEndpoint`] per accepted socket.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, warn};
use url::Url;
use wavelink_proto::{
    decode_client_message, decode_server_message, encode_client_message, encode_server_message,
    ClientMessage, ServerMessage,
};

use crate::history::UpdateHistory;
use crate::server::{Router, ServerEndpoint, ServerWire};
use crate::transport::{ClientTransport, LinkCore, TransportError, TransportKind, Wire};

pub mod config;
use config::WebSocketConfig;

struct OutboundQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl Wire for OutboundQueue {
    fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
        let text = encode_client_message(message)?;
        self.tx.send(text).map_err(|_| TransportError::ChannelClosed)
    }
}

impl ServerWire for OutboundQueue {
    fn send(&self, message: &ServerMessage) -> Result<(), TransportError> {
        let text = encode_server_message(message)?;
        self.tx.send(text).map_err(|_| TransportError::ChannelClosed)
    }
}

/// Connects to a WebSocket peer and returns a live transport.
pub async fn connect(config: WebSocketConfig) -> Result<ClientTransport, TransportError> {
    let url = config.build_url();
    Url::parse(&url).map_err(|err| TransportError::Setup(format!("invalid url {url}: {err}")))?;
    let (stream, _) = connect_async(&url)
        .await
        .map_err(|err| TransportError::Setup(format!("connect to {url} failed: {err}")))?;
    debug!(target = "wavelink::websocket", url, "connected");
    Ok(spawn_client(stream))
}

/// Wires an already-established WebSocket stream up as a client transport.
/// Used by [`connect`] and by tests driving a loopback socket directly.
pub fn spawn_client<S>(stream: WebSocketStream<S>) -> ClientTransport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let core = LinkCore::new(TransportKind::WebSocket, Box::new(OutboundQueue { tx: out_tx }));
    let (mut sink, mut source) = stream.split();

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });
    let reader = {
        let core = core.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => dispatch(&core, &text),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => dispatch(&core, &text),
                        Err(_) => warn!(
                            target = "wavelink::websocket",
                            "non-utf8 binary frame; dropping"
                        ),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {} // Ping/Pong handled by tungstenite
                    Err(err) => {
                        warn!(target = "wavelink::websocket", error = %err, "read failed");
                        break;
                    }
                }
            }
            core.disconnect("websocket closed");
        })
    };

    core.mark_connected();
    ClientTransport::new(core, vec![writer, reader])
}

fn dispatch(core: &Arc<LinkCore>, text: &str) {
    match decode_server_message(text) {
        Ok(message) => core.handle_message(message),
        Err(err) => warn!(
            target = "wavelink::websocket",
            error = %err,
            "undecodable frame; dropping"
        ),
    }
}

/// Serves one accepted socket until the peer closes it: performs the
/// WebSocket handshake, then dispatches inbound frames to a per-connection
/// endpoint in arrival order. Returns once the connection is torn down.
pub async fn serve_connection<S>(
    stream: S,
    router: Arc<dyn Router>,
    history_limit: usize,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = accept_async(stream)
        .await
        .map_err(|err| TransportError::Setup(format!("websocket accept failed: {err}")))?;
    let (mut sink, mut source) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let endpoint = ServerEndpoint::new(
        router,
        Arc::new(OutboundQueue { tx: out_tx }),
        Arc::new(UpdateHistory::new(history_limit)),
    );

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => serve_frame(&endpoint, &text).await,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => serve_frame(&endpoint, &text).await,
                Err(_) => warn!(
                    target = "wavelink::websocket",
                    "non-utf8 binary frame; dropping"
                ),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(target = "wavelink::websocket", error = %err, "read failed");
                break;
            }
        }
    }

    debug!(target = "wavelink::websocket", "peer closed; shutting down endpoint");
    endpoint.shutdown().await;
    writer.abort();
    Ok(())
}

async fn serve_frame(endpoint: &Arc<ServerEndpoint>, text: &str) {
    match decode_client_message(text) {
        Ok(message) => endpoint.handle_message(message).await,
        Err(err) => warn!(
            target = "wavelink::websocket",
            error = %err,
            "undecodable frame; dropping"
        ),
    }
}
