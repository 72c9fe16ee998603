//! Network subsystem: audio sources and listener connections

pub mod inbound;
pub mod playback;
pub mod relay;

pub use inbound::{InboundSource, SourceListener};
pub use playback::PlaybackListener;
pub use relay::{RelayClient, RelayHandle, RelaySource};

use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::protocol::SourceInfo;

/// Read buffer size for source and listener sockets
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Identifies one source connection for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(u64);

impl SourceId {
    /// Allocate a fresh, strictly increasing id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

/// Events a source connection reports to the stream core
#[derive(Debug)]
pub enum SourceEvent {
    /// Connection established. Sending on (or dropping) `closer`
    /// disconnects the source.
    Connected {
        info: SourceInfo,
        closer: oneshot::Sender<()>,
    },
    /// One `key: value` header line
    Metadata { key: String, value: String },
    /// Headers are done, audio follows
    Streaming,
    /// Audio bytes; whole frames for relays, raw reads for inbound sources
    Audio(Bytes),
    /// Song title decoded from the relay's in-band metadata
    SongTitle(String),
    AuthFailed,
    Closed,
}

/// Apply socket options shared by all long-lived connections
pub fn configure_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!("Failed to enable keepalive: {}", e);
    }
}
