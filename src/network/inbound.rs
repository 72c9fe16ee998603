//! Inbound SHOUTcast source connections
//!
//! An encoder connects, sends its password on the first line, then
//! `key: value` headers up to a blank line, then raw audio.

use bytes::Bytes;
use chrono::Utc;
use futures_util::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

use crate::auth::SharedHooks;
use crate::error::{Error, NetworkError, ProtocolError, Result};
use crate::network::{configure_socket, SourceEvent, SourceId, READ_BUFFER_SIZE};
use crate::protocol::{split_header_line, LineBuffer, SourceInfo, SourceKind, MAX_LINE_LEN, SOURCE_ACK};
use crate::stream::{CoreEvent, CoreSender};

/// Bytes a source may send ahead while its password is being checked
const MAX_PENDING_BYTES: usize = 16 * MAX_LINE_LEN;

/// Protocol position of an inbound source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundState {
    /// Waiting for the password line
    New,
    /// Password received, authentication pending
    GotPassword,
    /// Reading headers
    Authenticated,
    /// Everything received is audio
    Active,
}

/// Output of the inbound state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// The password to authenticate
    Password(String),
    Metadata { key: String, value: String },
    Streaming,
    Audio(Bytes),
}

/// Sans-IO state machine for one source connection
#[derive(Debug)]
pub struct InboundSource {
    state: InboundState,
    lines: LineBuffer,
}

impl Default for InboundSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundSource {
    pub fn new() -> Self {
        Self {
            state: InboundState::New,
            lines: LineBuffer::new(),
        }
    }

    pub fn state(&self) -> InboundState {
        self.state
    }

    /// Feed bytes read from the socket
    pub fn receive(&mut self, data: &[u8]) -> std::result::Result<Vec<InboundEvent>, ProtocolError> {
        self.lines.extend(data);
        self.process()
    }

    /// Authentication succeeded: parse whatever arrived in the meantime.
    /// The caller writes [`SOURCE_ACK`].
    pub fn accept(&mut self) -> std::result::Result<Vec<InboundEvent>, ProtocolError> {
        if self.state != InboundState::GotPassword {
            warn!("Authentication result in state {:?}", self.state);
            return Ok(Vec::new());
        }
        self.state = InboundState::Authenticated;
        self.process()
    }

    fn process(&mut self) -> std::result::Result<Vec<InboundEvent>, ProtocolError> {
        let mut events = Vec::new();
        loop {
            match self.state {
                InboundState::New => {
                    if let Some(password) = self.lines.next_line()? {
                        self.state = InboundState::GotPassword;
                        events.push(InboundEvent::Password(password));
                    }
                    return Ok(events);
                }
                InboundState::GotPassword => {
                    if self.lines.len() > MAX_PENDING_BYTES {
                        return Err(ProtocolError::HeadersTooLarge { limit: MAX_PENDING_BYTES });
                    }
                    return Ok(events);
                }
                InboundState::Authenticated => match self.lines.next_line()? {
                    Some(line) if line.is_empty() => {
                        self.state = InboundState::Active;
                        events.push(InboundEvent::Streaming);
                    }
                    Some(line) => {
                        let (key, value) = split_header_line(&line)?;
                        events.push(InboundEvent::Metadata { key, value });
                    }
                    None => return Ok(events),
                },
                InboundState::Active => {
                    if !self.lines.is_empty() {
                        events.push(InboundEvent::Audio(self.lines.take().freeze()));
                    }
                    return Ok(events);
                }
            }
        }
    }
}

/// Accepts source connections, one at a time
pub struct SourceListener {
    listener: TcpListener,
    hooks: SharedHooks,
    core: CoreSender,
}

impl SourceListener {
    pub fn new(listener: TcpListener, hooks: SharedHooks, core: CoreSender) -> Self {
        Self { listener, hooks, core }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. A connection arriving while a source is connected is
    /// closed immediately.
    pub async fn run(self) -> Result<()> {
        let slot = Arc::new(Semaphore::new(1));
        info!("Source listener on {}", self.local_addr()?);

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept source connection: {}", e);
                    continue;
                }
            };

            let Ok(permit) = slot.clone().try_acquire_owned() else {
                warn!("Refusing source connection from {}: a source is already connected", addr);
                drop(stream);
                continue;
            };

            configure_socket(&stream);
            let hooks = self.hooks.clone();
            let core = self.core.clone();
            tokio::spawn(async move {
                serve_source(stream, addr, hooks, core).await;
                drop(permit);
            });
        }
    }
}

/// Drive one source connection until it closes
pub async fn serve_source(mut stream: TcpStream, addr: SocketAddr, hooks: SharedHooks, core: CoreSender) {
    let id = SourceId::next();
    let (closer, mut close_rx) = oneshot::channel();
    let info = SourceInfo {
        kind: SourceKind::Inbound,
        address: addr.to_string(),
        connected_at: Utc::now(),
    };

    info!("Source connected: {} ({})", addr, id);
    if core.send(CoreEvent::source(id, SourceEvent::Connected { info, closer })).await.is_err() {
        return;
    }

    match drive(&mut stream, addr, id, &hooks, &core, &mut close_rx).await {
        Ok(()) => debug!("Source {} finished", addr),
        Err(Error::AuthenticationFailed { addr }) => {
            warn!("Source authentication failed for {}", addr);
            let _ = core.send(CoreEvent::source(id, SourceEvent::AuthFailed)).await;
        }
        Err(Error::Protocol(e)) => warn!("Protocol violation from source {}: {}", addr, e),
        Err(e) => debug!("Source {} connection error: {}", addr, e),
    }

    let _ = stream.shutdown().await;
    info!("Source closed: {}", addr);
    let _ = core.send(CoreEvent::source(id, SourceEvent::Closed)).await;
}

async fn drive(
    stream: &mut TcpStream,
    addr: SocketAddr,
    id: SourceId,
    hooks: &SharedHooks,
    core: &CoreSender,
    close_rx: &mut oneshot::Receiver<()>,
) -> Result<()> {
    let mut machine = InboundSource::new();
    let mut pending_auth: Option<BoxFuture<'static, bool>> = None;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let events = tokio::select! {
            _ = &mut *close_rx => {
                info!("Dropping source client ({})", addr);
                return Ok(());
            }
            allowed = wait_for(&mut pending_auth) => {
                pending_auth = None;
                if !allowed {
                    return Err(Error::AuthenticationFailed { addr });
                }
                stream.write_all(SOURCE_ACK).await?;
                debug!("Source {} authenticated", addr);
                machine.accept()?
            }
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                machine.receive(&buf[..n])?
            }
        };

        for event in events {
            let event = match event {
                InboundEvent::Password(password) => {
                    pending_auth = Some(hooks.authenticate(Some(addr.ip()), password, false));
                    continue;
                }
                InboundEvent::Metadata { key, value } => SourceEvent::Metadata { key, value },
                InboundEvent::Streaming => {
                    info!("Source started streaming: {}", addr);
                    SourceEvent::Streaming
                }
                InboundEvent::Audio(audio) => SourceEvent::Audio(audio),
            };
            core.send(CoreEvent::source(id, event))
                .await
                .map_err(|_| NetworkError::Closed)?;
        }
    }
}

/// Resolve a pending authentication, or never when none is pending
async fn wait_for(pending: &mut Option<BoxFuture<'static, bool>>) -> bool {
    match pending {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::mpeg::frame_384;

    #[test]
    fn test_password_then_headers_then_audio() {
        let mut source = InboundSource::new();

        let events = source.receive(b"hunter2\r\nicy-name: Test FM\r\n").unwrap();
        assert_eq!(events, vec![InboundEvent::Password("hunter2".to_string())]);
        assert_eq!(source.state(), InboundState::GotPassword);

        // more data while authentication is pending is only buffered
        assert!(source.receive(b"icy-br: 128\r\n\r\nAUDIO").unwrap().is_empty());

        let events = source.accept().unwrap();
        assert_eq!(
            events,
            vec![
                InboundEvent::Metadata { key: "icy-name".into(), value: "Test FM".into() },
                InboundEvent::Metadata { key: "icy-br".into(), value: "128".into() },
                InboundEvent::Streaming,
                InboundEvent::Audio(Bytes::from_static(b"AUDIO")),
            ]
        );
        assert_eq!(source.state(), InboundState::Active);
    }

    #[test]
    fn test_active_audio_is_passed_through_raw() {
        let mut source = InboundSource::new();
        source.receive(b"pw\n").unwrap();
        source.accept().unwrap();
        assert_eq!(source.receive(b"\r\n").unwrap(), vec![InboundEvent::Streaming]);

        let frame = frame_384();
        let events = source.receive(&frame[..100]).unwrap();
        assert_eq!(events, vec![InboundEvent::Audio(Bytes::from(frame[..100].to_vec()))]);
        // a blank-looking line is audio now
        let events = source.receive(b"\n\n").unwrap();
        assert_eq!(events, vec![InboundEvent::Audio(Bytes::from_static(b"\n\n"))]);
    }

    #[test]
    fn test_password_split_across_reads() {
        let mut source = InboundSource::new();
        assert!(source.receive(b"hun").unwrap().is_empty());
        assert_eq!(source.state(), InboundState::New);
        assert_eq!(
            source.receive(b"ter2\n").unwrap(),
            vec![InboundEvent::Password("hunter2".to_string())]
        );
    }

    #[test]
    fn test_unterminated_password_is_violation() {
        let mut source = InboundSource::new();
        let result = source.receive(&vec![b'x'; MAX_LINE_LEN + 10]);
        assert_eq!(result, Err(ProtocolError::LineTooLong { limit: MAX_LINE_LEN }));
    }

    #[test]
    fn test_accept_outside_pending_state_is_ignored() {
        let mut source = InboundSource::new();
        assert!(source.accept().unwrap().is_empty());
        assert_eq!(source.state(), InboundState::New);
    }

    #[test]
    fn test_header_without_colon_has_empty_value() {
        let mut source = InboundSource::new();
        source.receive(b"pw\n").unwrap();
        source.accept().unwrap();
        assert_eq!(
            source.receive(b"garbage line\n").unwrap(),
            vec![InboundEvent::Metadata { key: "garbage line".into(), value: String::new() }]
        );
        assert_eq!(source.state(), InboundState::Authenticated);
        assert!(matches!(
            source.receive(b": orphan value\n"),
            Err(ProtocolError::InvalidHeader(_))
        ));
    }
}
