//! Host-embedded IPC carrier: a connected Unix socket pair carrying JSON
//! messages as 4-byte big-endian length-prefixed frames. Both ends live in
//! the same process tree; the server side is spawned onto the runtime and
//! tears itself down when the client half closes.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use wavelink_proto::{
    decode_client_message, decode_server_message, encode_client_message, encode_server_message,
    ClientMessage, ServerMessage,
};

use crate::history::UpdateHistory;
use crate::server::{Router, ServerEndpoint, ServerWire};
use crate::transport::{ClientTransport, LinkCore, TransportError, TransportKind, Wire};

// Guards against a corrupt length prefix committing us to a huge read.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub struct IpcPair {
    pub client: ClientTransport,
    pub server: Arc<ServerEndpoint>,
}

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

async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, text: &str) -> io::Result<()> {
    // Mirrors the read-side guard; a length beyond u32 would otherwise
    // truncate into a corrupt prefix.
    if text.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", text.len()),
        ));
    }
    let len = text.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await
}

/// Reads one frame. `Ok(None)` is a clean close at a frame boundary.
async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Option<String>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 frame"))
}

/// Builds a connected client/server pair over an in-process Unix socket
/// pair. The server side runs detached and shuts down when the client side
/// closes its write half.
pub fn pair(router: Arc<dyn Router>, history_limit: usize) -> Result<IpcPair, TransportError> {
    let (client_stream, server_stream) =
        UnixStream::pair().map_err(|err| TransportError::Setup(err.to_string()))?;

    let endpoint = spawn_server(server_stream, router, history_limit);
    let client = spawn_client(client_stream);
    Ok(IpcPair {
        client,
        server: endpoint,
    })
}

fn spawn_client(stream: UnixStream) -> ClientTransport {
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let core = LinkCore::new(TransportKind::Ipc, Box::new(OutboundQueue { tx: out_tx }));

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if write_frame(&mut write_half, &text).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });
    let reader = {
        let core = core.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(text)) => match decode_server_message(&text) {
                        Ok(message) => core.handle_message(message),
                        Err(err) => warn!(
                            target = "wavelink::ipc",
                            error = %err,
                            "undecodable frame; dropping"
                        ),
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!(target = "wavelink::ipc", error = %err, "read failed");
                        break;
                    }
                }
            }
            core.disconnect("ipc peer closed");
        })
    };

    core.mark_connected();
    ClientTransport::new(core, vec![writer, reader])
}

fn spawn_server(
    stream: UnixStream,
    router: Arc<dyn Router>,
    history_limit: usize,
) -> Arc<ServerEndpoint> {
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let endpoint = ServerEndpoint::new(
        router,
        Arc::new(OutboundQueue { tx: out_tx }),
        Arc::new(UpdateHistory::new(history_limit)),
    );

    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if write_frame(&mut write_half, &text).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });
    {
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(text)) => match decode_client_message(&text) {
                        Ok(message) => endpoint.handle_message(message).await,
                        Err(err) => warn!(
                            target = "wavelink::ipc",
                            error = %err,
                            "undecodable frame; dropping"
                        ),
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!(target = "wavelink::ipc", error = %err, "read failed");
                        break;
                    }
                }
            }
            debug!(target = "wavelink::ipc", "client side closed; shutting down");
            endpoint.shutdown().await;
        });
    }

    endpoint
}
