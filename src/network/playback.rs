//! Listener connections
//!
//! A player sends an HTTP-like GET, gets an ICY response head and then the
//! live stream for as long as it stays connected.

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::clients::SessionId;
use crate::error::{Error, NetworkError, ProtocolError, Result};
use crate::network::{configure_socket, READ_BUFFER_SIZE};
use crate::protocol::{icy_response_head, PlaybackRequest, MAX_REQUEST_LEN};
use crate::stream::{CoreEvent, StreamHandle};

/// Chunks a listener may fall behind before it is dropped
pub const SESSION_QUEUE_LEN: usize = 64;

/// Time a player gets to send its request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest a single write may stall before the player is dropped
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

const NOT_FOUND: &[u8] = b"HTTP/1.0 404 Not Found\r\nContent-Type: text/plain\r\n\r\nNot Found\r\n";

/// Accepts player connections
pub struct PlaybackListener {
    listener: TcpListener,
    stream: StreamHandle,
    meta_interval: usize,
}

impl PlaybackListener {
    pub fn new(listener: TcpListener, stream: StreamHandle, meta_interval: usize) -> Self {
        Self {
            listener,
            stream,
            meta_interval,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!("Playback listener on {}", self.local_addr()?);
        loop {
            let (socket, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept listener connection: {}", e);
                    continue;
                }
            };

            configure_socket(&socket);
            let stream = self.stream.clone();
            let meta_interval = self.meta_interval;
            tokio::spawn(async move {
                match serve_listener(socket, addr, stream, meta_interval).await {
                    Ok(()) => {}
                    Err(Error::Protocol(e)) => warn!("Bad request from {}: {}", addr, e),
                    Err(e) => debug!("Listener {} connection error: {}", addr, e),
                }
            });
        }
    }
}

/// Offset one past the blank line ending a request head
fn head_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn read_request(socket: &mut TcpStream) -> Result<PlaybackRequest> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = head_end(&buf) {
            return Ok(PlaybackRequest::parse(&String::from_utf8_lossy(&buf[..end]))?);
        }
        if buf.len() > MAX_REQUEST_LEN {
            return Err(ProtocolError::HeadersTooLarge { limit: MAX_REQUEST_LEN }.into());
        }
        if socket.read_buf(&mut buf).await? == 0 {
            return Err(NetworkError::Closed.into());
        }
    }
}

/// Serve one player until either side hangs up
pub async fn serve_listener(
    mut socket: TcpStream,
    addr: SocketAddr,
    stream: StreamHandle,
    meta_interval: usize,
) -> Result<()> {
    let request = tokio::time::timeout(REQUEST_TIMEOUT, read_request(&mut socket))
        .await
        .map_err(|_| NetworkError::Closed)??;

    if !request.is_stream_request() {
        debug!("{} {} from {}: not found", request.method, request.path, addr);
        socket.write_all(NOT_FOUND).await?;
        let _ = socket.shutdown().await;
        return Ok(());
    }

    let wants_metadata = request.wants_metadata();
    let head = icy_response_head(&stream.metadata(), wants_metadata.then_some(meta_interval));
    socket.write_all(head.as_bytes()).await?;

    let (sink, mut chunks) = mpsc::channel::<Bytes>(SESSION_QUEUE_LEN);
    let (reply, admitted) = oneshot::channel();
    stream
        .sender()
        .send(CoreEvent::ClientConnected {
            remote: addr,
            user_agent: request.user_agent().map(str::to_string),
            wants_metadata,
            sink,
            reply,
        })
        .await
        .map_err(|_| NetworkError::Closed)?;
    let Some(id) = admitted.await.map_err(|_| NetworkError::Closed)? else {
        return Ok(());
    };

    pump(&mut socket, id, &mut chunks, WRITE_TIMEOUT).await;

    let _ = socket.shutdown().await;
    let _ = stream.sender().send(CoreEvent::ClientClosed { id }).await;
    Ok(())
}

/// Copy queued output to the socket. Ends when the session is dropped by
/// the core, the player disconnects or a write stalls past `write_timeout`.
async fn pump(
    socket: &mut TcpStream,
    id: SessionId,
    chunks: &mut mpsc::Receiver<Bytes>,
    write_timeout: Duration,
) {
    let (mut reader, mut writer) = socket.split();
    let mut discard = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            chunk = chunks.recv() => match chunk {
                Some(chunk) => match tokio::time::timeout(write_timeout, writer.write_all(&chunk)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Write to client {} failed: {}", id, e);
                        return;
                    }
                    Err(_) => {
                        info!("Client {} stopped reading, dropping", id);
                        return;
                    }
                },
                None => {
                    debug!("Client {} dropped by the stream", id);
                    return;
                }
            },
            read = reader.read(&mut discard) => match read {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
        }
    }
}
