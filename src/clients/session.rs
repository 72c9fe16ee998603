//! One connected listener

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::encoder::Interleaver;
use crate::error::NetworkError;
use crate::protocol::SessionInfo;

/// Opaque listener id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A listener socket as seen by the broadcast path.
///
/// Output goes to a bounded queue drained by the connection task. A full
/// queue means the listener cannot keep up.
pub struct ClientSession {
    id: SessionId,
    remote: SocketAddr,
    user_agent: Option<String>,
    connected_at: DateTime<Utc>,
    interleaver: Interleaver,
    sink: mpsc::Sender<Bytes>,
}

impl ClientSession {
    pub fn new(
        id: SessionId,
        remote: SocketAddr,
        user_agent: Option<String>,
        meta_interval: Option<usize>,
        sink: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            id,
            remote,
            user_agent,
            connected_at: Utc::now(),
            interleaver: Interleaver::new(meta_interval),
            sink,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn wants_metadata(&self) -> bool {
        self.interleaver.interval().is_some()
    }

    /// Audio bytes queued so far
    pub fn bytes_sent(&self) -> u64 {
        self.interleaver.audio_bytes()
    }

    /// Queue `audio`, with metadata for `title` interleaved as needed.
    /// Never waits.
    pub fn write(&mut self, audio: &[u8], title: &str) -> Result<(), NetworkError> {
        if audio.is_empty() {
            return Ok(());
        }

        let mut out = BytesMut::with_capacity(audio.len() + 64);
        self.interleaver.write(audio, title, &mut out);
        self.sink.try_send(out.freeze()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::SlowConsumer,
            mpsc::error::TrySendError::Closed(_) => NetworkError::Closed,
        })
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.to_string(),
            remote_ip: self.remote.ip().to_string(),
            user_agent: self.user_agent.clone(),
            bytes_sent: self.bytes_sent(),
            wants_metadata: self.wants_metadata(),
            connected_at: self.connected_at,
        }
    }
}
