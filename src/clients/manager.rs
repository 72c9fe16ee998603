//! Live listener set and broadcast fan-out

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::clients::session::{ClientSession, SessionId};
use crate::error::NetworkError;
use crate::protocol::SessionInfo;
use crate::stream::StreamEvent;

/// Owns every connected listener
pub struct BroadcastManager {
    sessions: HashMap<SessionId, ClientSession>,
    meta_interval: usize,
    events: broadcast::Sender<StreamEvent>,
}

impl BroadcastManager {
    pub fn new(meta_interval: usize, events: broadcast::Sender<StreamEvent>) -> Self {
        Self {
            sessions: HashMap::new(),
            meta_interval,
            events,
        }
    }

    /// Register a listener and prime it with `backlog`.
    ///
    /// A listener whose priming write fails is never registered.
    pub fn new_session(
        &mut self,
        remote: SocketAddr,
        user_agent: Option<String>,
        wants_metadata: bool,
        sink: mpsc::Sender<Bytes>,
        backlog: &[u8],
        title: &str,
    ) -> Result<SessionId, NetworkError> {
        let mut id = SessionId::random();
        while self.sessions.contains_key(&id) {
            id = SessionId::random();
        }

        let meta_interval = wants_metadata.then_some(self.meta_interval);
        let mut session = ClientSession::new(id, remote, user_agent, meta_interval, sink);
        session.write(backlog, title)?;

        self.sessions.insert(id, session);
        info!("Client connected: {} ({})", id, remote);
        let _ = self.events.send(StreamEvent::ClientConnected { id, remote });
        Ok(id)
    }

    /// Disconnect a listener. Dropping the session closes its queue, which
    /// ends the connection task.
    pub fn kick(&mut self, id: SessionId) -> bool {
        let kicked = self.remove(id).is_some();
        if kicked {
            info!("Kicked listener {}", id);
        }
        kicked
    }

    /// Remove a listener. Safe to call any number of times; only the first
    /// call reports a disconnect.
    pub fn remove(&mut self, id: SessionId) -> Option<ClientSession> {
        let session = self.sessions.remove(&id)?;
        info!("Client disconnected: {}", id);
        let _ = self.events.send(StreamEvent::ClientDisconnected { id });
        Some(session)
    }

    /// Send `frame` to every listener. A listener that fails is dropped
    /// without affecting the others.
    pub fn broadcast(&mut self, frame: &[u8], title: &str) {
        let failed: Vec<(SessionId, NetworkError)> = self
            .sessions
            .values_mut()
            .filter_map(|session| session.write(frame, title).err().map(|e| (session.id(), e)))
            .collect();

        for (id, error) in failed {
            match error {
                NetworkError::SlowConsumer => info!("Dropping slow client {}", id),
                other => debug!("Client {} write failed: {}", id, other),
            }
            self.remove(id);
        }
    }

    pub fn get(&self, id: SessionId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.values().map(ClientSession::info).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
