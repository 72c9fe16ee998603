//! Outbound relay from another ICY server
//!
//! Requests the upstream stream with `Icy-MetaData: 1`, strips the
//! interleaved metadata blocks and re-frames the audio. Dropped connections
//! are retried after a fixed delay.

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::decoder::{parse_stream_title, MetadataDecoder, Step};
use crate::codec::mpeg::{split_frames_before, MAX_FRAME_LEN};
use crate::config::RelayConfig;
use crate::error::{NetworkError, ProtocolError, Result};
use crate::network::{configure_socket, SourceEvent, SourceId, READ_BUFFER_SIZE};
use crate::protocol::{relay_request, split_header_line, LineBuffer, SourceInfo, SourceKind, ICY_OK};
use crate::stream::{CoreEvent, CoreSender};

/// Protocol position of the relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// No connection
    New,
    Connecting,
    /// Request sent, waiting for the status line
    Connected,
    /// Reading headers
    GotStatus,
    /// Reading interleaved audio and metadata
    Active,
}

/// Output of the relay state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Metadata { key: String, value: String },
    Streaming,
    /// One complete MPEG frame
    Audio(Bytes),
    SongTitle(String),
}

/// Sans-IO state machine for the upstream connection
#[derive(Debug)]
pub struct RelaySource {
    state: RelayState,
    lines: LineBuffer,
    audio: BytesMut,
    decoder: MetadataDecoder,
}

impl Default for RelaySource {
    fn default() -> Self {
        Self::new()
    }
}

impl RelaySource {
    pub fn new() -> Self {
        Self {
            state: RelayState::New,
            lines: LineBuffer::new(),
            audio: BytesMut::new(),
            decoder: MetadataDecoder::new(0),
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Negotiated `icy-metaint`, zero when the upstream sends none
    pub fn meta_interval(&self) -> usize {
        self.decoder.interval()
    }

    /// Start a new attempt, discarding anything left from the last one
    pub fn connecting(&mut self) {
        *self = Self::new();
        self.state = RelayState::Connecting;
    }

    /// The socket is up and the request has been written
    pub fn connected(&mut self) {
        self.state = RelayState::Connected;
    }

    pub fn close(&mut self) {
        *self = Self::new();
    }

    /// Feed bytes read from the socket
    pub fn receive(&mut self, data: &[u8]) -> std::result::Result<Vec<RelayEvent>, ProtocolError> {
        let mut events = Vec::new();
        if self.state == RelayState::Active {
            self.audio.extend_from_slice(data);
            self.handle_audio(&mut events);
            return Ok(events);
        }

        self.lines.extend(data);
        loop {
            match self.state {
                RelayState::Connected => match self.lines.next_line()? {
                    Some(status) => {
                        debug!("Relay received status: {}", status);
                        if status != ICY_OK {
                            return Err(ProtocolError::InvalidStatusLine(status));
                        }
                        self.state = RelayState::GotStatus;
                    }
                    None => return Ok(events),
                },
                RelayState::GotStatus => match self.lines.next_line()? {
                    Some(line) if line.is_empty() => {
                        self.state = RelayState::Active;
                        events.push(RelayEvent::Streaming);
                        let rest = self.lines.take();
                        self.audio.extend_from_slice(&rest);
                        self.handle_audio(&mut events);
                        return Ok(events);
                    }
                    Some(line) => {
                        let (key, value) = split_header_line(&line)?;
                        if key.eq_ignore_ascii_case("icy-metaint") {
                            let interval = value
                                .parse::<usize>()
                                .ok()
                                .filter(|&interval| interval > 0)
                                .ok_or_else(|| ProtocolError::InvalidMetaInterval(value.clone()))?;
                            self.decoder = MetadataDecoder::new(interval);
                        }
                        events.push(RelayEvent::Metadata { key, value });
                    }
                    None => return Ok(events),
                },
                state => {
                    warn!("Relay data received in state {:?}", state);
                    return Ok(events);
                }
            }
        }
    }

    /// Cut frames and titles out of the audio buffer in stream order
    fn handle_audio(&mut self, events: &mut Vec<RelayEvent>) {
        loop {
            let limit = self.decoder.boundary().unwrap_or(usize::MAX);
            let (frames, consumed) = split_frames_before(&mut self.audio, limit);
            self.decoder.consume(consumed);
            events.extend(frames.into_iter().map(RelayEvent::Audio));

            match self.decoder.extract_next(&mut self.audio) {
                Step::Block(Some(payload)) => match parse_stream_title(&payload) {
                    Some(title) => events.push(RelayEvent::SongTitle(title)),
                    None => warn!("Could not parse metadata: {}", payload),
                },
                Step::Block(None) => {}
                Step::Incomplete | Step::Pending => break,
            }
        }
        self.discard_unsynced();
    }

    /// Drop audio that can no longer start a complete frame.
    ///
    /// Every frame starting before the last `MAX_FRAME_LEN` bytes ahead of the
    /// next metadata block has already been cut.
    fn discard_unsynced(&mut self) {
        let window = self
            .decoder
            .boundary()
            .map_or(self.audio.len(), |boundary| boundary.min(self.audio.len()));
        if window > MAX_FRAME_LEN {
            let excess = window - MAX_FRAME_LEN;
            let _ = self.audio.split_to(excess);
            self.decoder.consume(excess);
            debug!("Relay discarded {} bytes without frame sync", excess);
        }
    }
}

/// Commands for a running relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    /// Drop the current connection and connect again right away
    Reconnect,
    /// Disconnect and cancel any scheduled reconnect
    Shutdown,
}

/// Control handle for a spawned [`RelayClient`]
#[derive(Debug, Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    pub async fn reconnect(&self) {
        let _ = self.commands.send(RelayCommand::Reconnect).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(RelayCommand::Shutdown).await;
    }
}

/// The single pending reconnect of a relay
#[derive(Debug, Default)]
pub struct ReconnectTimer {
    deadline: Option<Instant>,
}

impl ReconnectTimer {
    /// Schedule a reconnect, replacing any pending one
    pub fn schedule(&mut self, delay: Duration) {
        self.deadline = Some(Instant::now() + delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Completes when the pending reconnect is due; never when none is
    pub async fn expired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}

/// What to do after a connection ends
enum Flow {
    Retry,
    RetryNow,
    Stop,
}

/// Upstream connection driver
pub struct RelayClient {
    config: RelayConfig,
    user_agent: String,
    core: CoreSender,
    commands: mpsc::Receiver<RelayCommand>,
}

impl RelayClient {
    pub fn new(config: RelayConfig, core: CoreSender) -> (Self, RelayHandle) {
        let (tx, rx) = mpsc::channel(8);
        let client = Self {
            config,
            user_agent: format!("icy-relay/{} (relaying)", env!("CARGO_PKG_VERSION")),
            core,
            commands: rx,
        };
        (client, RelayHandle { commands: tx })
    }

    fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Connect, stream, and reconnect until shut down
    pub async fn run(mut self) {
        let delay = Duration::from_secs(self.config.reconnect_delay_secs);
        let mut timer = ReconnectTimer::default();
        timer.schedule(Duration::ZERO);

        loop {
            tokio::select! {
                _ = timer.expired() => {}
                command = self.commands.recv() => match command {
                    Some(RelayCommand::Reconnect) => timer.schedule(Duration::ZERO),
                    Some(RelayCommand::Shutdown) | None => {
                        timer.cancel();
                        info!("Relay stopped");
                        return;
                    }
                },
            }
            if timer.is_pending() {
                continue;
            }

            match self.connect_once().await {
                Flow::Stop => {
                    info!("Relay stopped");
                    return;
                }
                Flow::RetryNow => timer.schedule(Duration::ZERO),
                Flow::Retry => {
                    info!("Relay reconnecting in {:?}", delay);
                    timer.schedule(delay);
                }
            }
        }
    }

    async fn connect_once(&mut self) -> Flow {
        let address = self.address();
        let mut machine = RelaySource::new();
        machine.connecting();
        info!("Relay connecting ({})", address);

        let connect = TcpStream::connect((self.config.host.as_str(), self.config.port));
        let mut stream = tokio::select! {
            result = connect => match result {
                Ok(stream) => stream,
                Err(source) => {
                    warn!("{}", NetworkError::ConnectFailed { addr: address, source });
                    return Flow::Retry;
                }
            },
            command = self.commands.recv() => return flow_for(command),
        };
        configure_socket(&stream);

        let id = SourceId::next();
        let (closer, mut close_rx) = oneshot::channel();
        let info = SourceInfo {
            kind: SourceKind::Relay,
            address: address.clone(),
            connected_at: Utc::now(),
        };
        if self.core.send(CoreEvent::source(id, SourceEvent::Connected { info, closer })).await.is_err() {
            return Flow::Stop;
        }

        let flow = match self.stream_audio(&mut stream, &mut machine, id, &mut close_rx).await {
            Ok(flow) => flow,
            Err(e) => {
                warn!("Relay connection to {} failed: {}", address, e);
                Flow::Retry
            }
        };

        machine.close();
        let _ = stream.shutdown().await;
        info!("Closing relay connection ({})", address);
        if self.core.send(CoreEvent::source(id, SourceEvent::Closed)).await.is_err() {
            return Flow::Stop;
        }
        flow
    }

    async fn stream_audio(
        &mut self,
        stream: &mut TcpStream,
        machine: &mut RelaySource,
        id: SourceId,
        close_rx: &mut oneshot::Receiver<()>,
    ) -> Result<Flow> {
        let request = relay_request(&self.config.path, &self.config.host, &self.user_agent);
        stream.write_all(request.as_bytes()).await?;
        machine.connected();
        info!("Relay connected");

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let events = tokio::select! {
                _ = &mut *close_rx => {
                    info!("Relay source kicked");
                    return Ok(Flow::Retry);
                }
                command = self.commands.recv() => return Ok(flow_for(command)),
                read = stream.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(Flow::Retry);
                    }
                    machine.receive(&buf[..n])?
                }
            };

            for event in events {
                let event = match event {
                    RelayEvent::Metadata { key, value } => SourceEvent::Metadata { key, value },
                    RelayEvent::Streaming => SourceEvent::Streaming,
                    RelayEvent::Audio(frame) => SourceEvent::Audio(frame),
                    RelayEvent::SongTitle(title) => SourceEvent::SongTitle(title),
                };
                self.core
                    .send(CoreEvent::source(id, event))
                    .await
                    .map_err(|_| NetworkError::Closed)?;
            }
        }
    }
}

fn flow_for(command: Option<RelayCommand>) -> Flow {
    match command {
        Some(RelayCommand::Reconnect) => Flow::RetryNow,
        Some(RelayCommand::Shutdown) | None => Flow::Stop,
    }
}
