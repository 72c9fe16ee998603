//! Stream coordinator
//!
//! [`StreamCore`] is the single owner of the backlog, the listener set and
//! the source registry. Connection tasks and the admin surface talk to it
//! through a bounded queue of [`CoreEvent`]s; queries carry a oneshot
//! reply. Observers follow along on a broadcast bus of [`StreamEvent`]s.

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::audio::BacklogBuffer;
use crate::auth::SharedHooks;
use crate::clients::{BroadcastManager, SessionId};
use crate::codec::mpeg::{split_frames, MAX_FRAME_LEN};
use crate::config::{MetaOverride, StreamConfig};
use crate::error::{NetworkError, Result};
use crate::network::{SourceEvent, SourceId};
use crate::protocol::{SessionInfo, SourceInfo, StationField, StreamMetadata};

/// Depth of the core event queue
pub const CORE_QUEUE_LEN: usize = 1024;

/// Depth of the notification bus
pub const EVENT_BUS_LEN: usize = 256;

pub type CoreSender = mpsc::Sender<CoreEvent>;

/// Station metadata shared with readers outside the core
pub type SharedMetadata = Arc<RwLock<StreamMetadata>>;

/// Notifications about sources and listeners
#[derive(Debug, Clone)]
pub enum StreamEvent {
    SourceConnected { id: SourceId, info: SourceInfo },
    SourceStreaming { id: SourceId },
    SourceClosed { id: SourceId },
    SourceAuthFailed { id: SourceId },
    SongChanged { title: String },
    ClientConnected { id: SessionId, remote: SocketAddr },
    ClientDisconnected { id: SessionId },
}

/// Everything the core task reacts to
#[derive(Debug)]
pub enum CoreEvent {
    Source {
        id: SourceId,
        event: SourceEvent,
    },
    /// A listener finished its handshake. `reply` gets `None` if it could
    /// not be admitted.
    ClientConnected {
        remote: SocketAddr,
        user_agent: Option<String>,
        wants_metadata: bool,
        sink: mpsc::Sender<Bytes>,
        reply: oneshot::Sender<Option<SessionId>>,
    },
    ClientClosed {
        id: SessionId,
    },
    KickListener {
        id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    KickSource {
        reply: oneshot::Sender<bool>,
    },
    /// Run a title through the song title hook, then apply it
    UpdateSongTitle {
        candidate: String,
        reply: Option<oneshot::Sender<String>>,
    },
    /// Result of the song title hook
    SongTitleAccepted {
        title: String,
        reply: Option<oneshot::Sender<String>>,
    },
    ListSessions {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    CurrentSource {
        reply: oneshot::Sender<Option<SourceInfo>>,
    },
}

impl CoreEvent {
    pub fn source(id: SourceId, event: SourceEvent) -> Self {
        Self::Source { id, event }
    }
}

/// A source known to the core
struct SourceEntry {
    info: SourceInfo,
    closer: Option<oneshot::Sender<()>>,
    streaming: bool,
}

/// The coordinating task
pub struct StreamCore {
    backlog: BacklogBuffer,
    /// Raw inbound audio not yet cut into frames
    aligner: BytesMut,
    manager: BroadcastManager,
    metadata: SharedMetadata,
    overrides: MetaOverride,
    sources: HashMap<SourceId, SourceEntry>,
    active: Option<SourceId>,
    hooks: SharedHooks,
    inbox: mpsc::Receiver<CoreEvent>,
    /// Lets hook tasks report back without keeping the queue open
    loopback: mpsc::WeakSender<CoreEvent>,
    events: broadcast::Sender<StreamEvent>,
}

impl StreamCore {
    pub fn new(config: &StreamConfig, hooks: SharedHooks) -> (Self, StreamHandle) {
        let (tx, rx) = mpsc::channel(CORE_QUEUE_LEN);
        let (events, _) = broadcast::channel(EVENT_BUS_LEN);

        let mut initial = StreamMetadata::default();
        config.meta_override.apply(&mut initial);
        let metadata = Arc::new(RwLock::new(initial));

        let core = Self {
            backlog: BacklogBuffer::new(config.buffer_size),
            aligner: BytesMut::new(),
            manager: BroadcastManager::new(config.meta_interval, events.clone()),
            metadata: metadata.clone(),
            overrides: config.meta_override.clone(),
            sources: HashMap::new(),
            active: None,
            hooks,
            inbox: rx,
            loopback: tx.downgrade(),
            events: events.clone(),
        };
        let handle = StreamHandle {
            sender: tx,
            metadata,
            events,
        };
        (core, handle)
    }

    /// Process events until every sender is gone.
    ///
    /// Returns an error only for a corrupted backlog.
    pub async fn run(mut self) -> Result<()> {
        info!("Stream core started");
        while let Some(event) = self.inbox.recv().await {
            if let Err(e) = self.handle(event) {
                error!("Stream core stopped: {}", e);
                return Err(e);
            }
        }
        info!("Stream core stopped");
        Ok(())
    }

    pub fn handle(&mut self, event: CoreEvent) -> Result<()> {
        match event {
            CoreEvent::Source { id, event } => return self.handle_source(id, event),
            CoreEvent::ClientConnected {
                remote,
                user_agent,
                wants_metadata,
                sink,
                reply,
            } => {
                let title = self.metadata.read().song_title.clone();
                let backlog = self.backlog.snapshot();
                let admitted = match self
                    .manager
                    .new_session(remote, user_agent, wants_metadata, sink, &backlog, &title)
                {
                    Ok(id) => Some(id),
                    Err(e) => {
                        debug!("Could not admit client {}: {}", remote, e);
                        None
                    }
                };
                let _ = reply.send(admitted);
            }
            CoreEvent::ClientClosed { id } => {
                self.manager.remove(id);
            }
            CoreEvent::KickListener { id, reply } => {
                let _ = reply.send(self.manager.kick(id));
            }
            CoreEvent::KickSource { reply } => {
                let _ = reply.send(self.kick_source());
            }
            CoreEvent::UpdateSongTitle { candidate, reply } => self.filter_song_title(candidate, reply),
            CoreEvent::SongTitleAccepted { title, reply } => {
                self.set_song_title(&title);
                if let Some(reply) = reply {
                    let _ = reply.send(title);
                }
            }
            CoreEvent::ListSessions { reply } => {
                let _ = reply.send(self.manager.list());
            }
            CoreEvent::CurrentSource { reply } => {
                let current = self
                    .active
                    .and_then(|id| self.sources.get(&id))
                    .map(|entry| entry.info.clone());
                let _ = reply.send(current);
            }
        }
        Ok(())
    }

    fn handle_source(&mut self, id: SourceId, event: SourceEvent) -> Result<()> {
        match event {
            SourceEvent::Connected { info, closer } => {
                info!("Source {} registered ({:?} {})", id, info.kind, info.address);
                let _ = self.events.send(StreamEvent::SourceConnected { id, info: info.clone() });
                self.sources.insert(
                    id,
                    SourceEntry {
                        info,
                        closer: Some(closer),
                        streaming: false,
                    },
                );
            }
            SourceEvent::Metadata { key, value } => {
                if self.accepts_headers_from(id) {
                    self.apply_header(&key, &value);
                } else {
                    debug!("Ignoring header from stale source {}", id);
                }
            }
            SourceEvent::Streaming => {
                let Some(entry) = self.sources.get_mut(&id) else {
                    return Ok(());
                };
                entry.streaming = true;
                if let Some(previous) = self.active.replace(id) {
                    if previous != id {
                        info!("Source {} supersedes {}", id, previous);
                    }
                }
                // a partial frame from the superseded source is useless
                self.aligner.clear();
                let _ = self.events.send(StreamEvent::SourceStreaming { id });
            }
            SourceEvent::Audio(data) => {
                if self.active == Some(id) {
                    self.handle_audio(&data)?;
                }
            }
            SourceEvent::SongTitle(title) => {
                if self.active == Some(id) {
                    self.filter_song_title(title, None);
                }
            }
            SourceEvent::AuthFailed => {
                let _ = self.events.send(StreamEvent::SourceAuthFailed { id });
            }
            SourceEvent::Closed => {
                if self.sources.remove(&id).is_none() {
                    return Ok(());
                }
                if self.active == Some(id) {
                    self.active = None;
                    self.aligner.clear();
                    self.metadata.write().bitrate_kbps = 0;
                }
                let _ = self.events.send(StreamEvent::SourceClosed { id });
            }
        }
        Ok(())
    }

    /// Headers apply from the active source, or from a newer source that
    /// has not started streaming yet.
    fn accepts_headers_from(&self, id: SourceId) -> bool {
        let Some(entry) = self.sources.get(&id) else {
            return false;
        };
        match self.active {
            Some(active) if active == id => true,
            Some(active) => !entry.streaming && id > active,
            None => true,
        }
    }

    fn apply_header(&mut self, key: &str, value: &str) {
        let Some(field) = StationField::from_header(key) else {
            debug!("Unmapped source header {}: {}", key, value);
            return;
        };

        let mut metadata = self.metadata.write();
        match field {
            StationField::Name if self.overrides.station_name.is_none() => {
                metadata.station_name = value.to_string()
            }
            StationField::Url if self.overrides.station_url.is_none() => {
                metadata.station_url = value.to_string()
            }
            StationField::Genre if self.overrides.station_genre.is_none() => {
                metadata.station_genre = value.to_string()
            }
            StationField::Bitrate => match value.parse() {
                Ok(kbps) => metadata.bitrate_kbps = kbps,
                Err(_) => warn!("Invalid icy-br value: {}", value),
            },
            _ => debug!("Header {} overridden by configuration", key),
        }
    }

    fn handle_audio(&mut self, data: &[u8]) -> Result<()> {
        self.aligner.extend_from_slice(data);
        let (frames, _) = split_frames(&mut self.aligner);
        if frames.is_empty() && self.aligner.len() > MAX_FRAME_LEN {
            let excess = self.aligner.len() - MAX_FRAME_LEN;
            let _ = self.aligner.split_to(excess);
        }

        let title = self.metadata.read().song_title.clone();
        for frame in frames {
            self.backlog.append(&frame)?;
            self.manager.broadcast(&frame, &title);
        }
        Ok(())
    }

    /// Hand `candidate` to the song title hook off the core task; the
    /// result comes back as [`CoreEvent::SongTitleAccepted`].
    fn filter_song_title(&self, candidate: String, reply: Option<oneshot::Sender<String>>) {
        let filtered = self.hooks.update_song_title(candidate);
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            let title = filtered.await;
            if let Some(core) = loopback.upgrade() {
                let _ = core.send(CoreEvent::SongTitleAccepted { title, reply }).await;
            }
        });
    }

    fn set_song_title(&mut self, title: &str) {
        {
            let mut metadata = self.metadata.write();
            if metadata.song_title == title {
                return;
            }
            metadata.song_title = title.to_string();
        }
        info!("Song title: {}", title);
        let _ = self.events.send(StreamEvent::SongChanged { title: title.to_string() });
    }

    /// Disconnect the active source, or the newest one when none is active
    fn kick_source(&mut self) -> bool {
        let Some(id) = self.active.or_else(|| self.sources.keys().max().copied()) else {
            return false;
        };
        let Some(closer) = self.sources.get_mut(&id).and_then(|entry| entry.closer.take()) else {
            return false;
        };
        info!("Kicking source {}", id);
        closer.send(()).is_ok()
    }
}

/// Cloneable access to a running [`StreamCore`]
#[derive(Debug, Clone)]
pub struct StreamHandle {
    sender: CoreSender,
    metadata: SharedMetadata,
    events: broadcast::Sender<StreamEvent>,
}

impl StreamHandle {
    /// Queue for connection tasks
    pub fn sender(&self) -> CoreSender {
        self.sender.clone()
    }

    /// Current station metadata
    pub fn metadata(&self) -> StreamMetadata {
        self.metadata.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> CoreEvent) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| NetworkError::Closed)?;
        Ok(rx.await.map_err(|_| NetworkError::Closed)?)
    }

    /// Run `candidate` through the song title hook and apply the result.
    /// Returns the title that was applied.
    pub async fn update_song_title(&self, candidate: impl Into<String>) -> Result<String> {
        let candidate = candidate.into();
        self.request(|reply| CoreEvent::UpdateSongTitle {
            candidate,
            reply: Some(reply),
        })
        .await
    }

    pub async fn kick_source(&self) -> Result<bool> {
        self.request(|reply| CoreEvent::KickSource { reply }).await
    }

    pub async fn kick_listener(&self, id: SessionId) -> Result<bool> {
        self.request(|reply| CoreEvent::KickListener { id, reply }).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        self.request(|reply| CoreEvent::ListSessions { reply }).await
    }

    pub async fn current_source(&self) -> Result<Option<SourceInfo>> {
        self.request(|reply| CoreEvent::CurrentSource { reply }).await
    }
}
